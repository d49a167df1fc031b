use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, Method},
    middleware::Next,
    response::Response,
};
use cookie::Cookie;

use crate::api::v1::auth::{decode_token, Claims, AUTH_COOKIE};
use crate::errors::AppError;
use crate::InnerState;

/// Decodes the JWT when one is sent and stores its claims on the request.
///
/// Requests without a token only get through for safe methods; handlers that
/// need a user for reads too ask for [`CurrentUser`].
pub async fn auth_middleware(
    State(inner): State<InnerState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    match extract_token(&request) {
        Some(token) => {
            let claims = decode_token(&token, &inner.settings)?;
            tracing::debug!(user_id = claims.user_id, "Request authenticated");
            request.extensions_mut().insert(claims);
        }
        None if !is_safe_method(request.method()) => {
            tracing::warn!(method = %request.method(), "Rejected anonymous write");
            return Err(AppError::unauthenticated());
        }
        None => {}
    }

    Ok(next.run(request).await)
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Extracts JWT from either the `Authorization` header or `Cookie` header.
fn extract_token<B>(req: &axum::http::Request<B>) -> Option<String> {
    // Check Authorization: Bearer <token>
    if let Some(auth_header) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    // Check Cookie: auth-token=<token>
    if let Some(cookie_header) = req.headers().get(header::COOKIE) {
        if let Ok(cookie_str) = cookie_header.to_str() {
            for cookie in cookie_str.split(';') {
                if let Ok(parsed) = Cookie::parse(cookie.trim()) {
                    if parsed.name() == AUTH_COOKIE && !parsed.value().is_empty() {
                        return Some(parsed.value().to_string());
                    }
                }
            }
        }
    }

    None
}

/// The authenticated caller. Rejects with 401 when the request carried no token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub email: String,
    pub is_staff: bool,
}

impl CurrentUser {
    /// Staff may act on anything; everyone else only on what they own.
    pub fn ensure_owner(&self, owner_id: i64) -> Result<(), AppError> {
        if self.is_staff || self.id == owner_id {
            Ok(())
        } else {
            tracing::warn!(user_id = self.id, owner_id, "Ownership check failed");
            Err(AppError::forbidden())
        }
    }

    pub fn ensure_staff(&self) -> Result<(), AppError> {
        if self.is_staff {
            Ok(())
        } else {
            Err(AppError::forbidden())
        }
    }
}

impl From<&Claims> for CurrentUser {
    fn from(claims: &Claims) -> Self {
        CurrentUser {
            id: claims.user_id,
            email: claims.sub.clone(),
            is_staff: claims.is_staff(),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Claims>()
            .map(CurrentUser::from)
            .ok_or_else(AppError::unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(name: header::HeaderName, value: &str) -> axum::http::Request<()> {
        axum::http::Request::builder()
            .header(name, value)
            .body(())
            .unwrap()
    }

    #[test]
    fn bearer_header_is_preferred() {
        let request = request_with(header::AUTHORIZATION, "Bearer abc.def.ghi");
        assert_eq!(extract_token(&request).as_deref(), Some("abc.def.ghi"));
    }

    #[test]
    fn token_is_read_from_cookie() {
        let request = request_with(header::COOKIE, "theme=dark; auth-token=xyz");
        assert_eq!(extract_token(&request).as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_token_yields_none() {
        let request = request_with(header::COOKIE, "theme=dark");
        assert!(extract_token(&request).is_none());
    }

    #[test]
    fn staff_passes_ownership_checks() {
        let staff = CurrentUser { id: 1, email: "s@x.io".into(), is_staff: true };
        let user = CurrentUser { id: 2, email: "u@x.io".into(), is_staff: false };
        assert!(staff.ensure_owner(9).is_ok());
        assert!(user.ensure_owner(2).is_ok());
        assert!(matches!(user.ensure_owner(9), Err(AppError::Permission(_))));
    }
}
