use cookie::{Cookie, SameSite};
use time::OffsetDateTime;
use tower_cookies::Cookies;

use crate::api::v1::auth::AUTH_COOKIE;
use crate::config::{Environment, Settings};
use crate::errors::AppError;

pub fn setup_auth_cookie(token: &str, settings: &Settings, cookies: &Cookies) {
    let mut cookie = Cookie::new(AUTH_COOKIE, token.to_string());

    match settings.environment {
        // Plain HTTP on localhost
        Environment::Development => {
            cookie.set_same_site(SameSite::Lax);
            cookie.set_secure(false);
        }
        Environment::Production => {
            if let Some(domain) = &settings.cookie_domain {
                let cookie_domain = if domain.starts_with('.') {
                    domain.to_string()
                } else {
                    format!(".{}", domain)
                };
                cookie.set_domain(cookie_domain);
            }
            cookie.set_same_site(SameSite::None);
            cookie.set_secure(true);
        }
    }

    let expires = OffsetDateTime::now_utc() + time::Duration::days(settings.token_ttl_days);

    cookie.set_path("/");
    cookie.set_expires(expires);
    cookie.set_http_only(true);
    cookies.add(cookie);
}

pub fn clear_auth_cookie(cookies: &Cookies) {
    let mut cookie = Cookie::from(AUTH_COOKIE);
    cookie.set_path("/");
    cookie.make_removal();
    cookies.remove(cookie);
}

pub async fn timeout_query<T, F>(duration: std::time::Duration, fut: F) -> Result<T, AppError>
where
    F: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(res)) => Ok(res),
        Ok(Err(e)) => Err(AppError::from(e)),
        Err(elapsed) => {
            tracing::error!("Query timeout after {:?}", duration);
            Err(AppError::Timeout(elapsed))
        }
    }
}

/// Trims `value` and checks it is non-empty and at most `max` characters.
pub fn required_text(
    field: &str,
    value: &str,
    max: usize,
    errors: &mut std::collections::HashMap<String, Vec<String>>,
) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        errors
            .entry(field.to_string())
            .or_default()
            .push("This field may not be blank.".to_string());
    } else if trimmed.chars().count() > max {
        errors
            .entry(field.to_string())
            .or_default()
            .push(format!("Ensure this field has no more than {} characters.", max));
    }
    trimmed.to_string()
}

/// Checks that `value` is one of `choices`.
pub fn check_choice(
    field: &str,
    value: &str,
    choices: &[&str],
    errors: &mut std::collections::HashMap<String, Vec<String>>,
) {
    if !choices.contains(&value) {
        errors
            .entry(field.to_string())
            .or_default()
            .push(format!("\"{}\" is not a valid choice.", value));
    }
}

pub fn finish_validation(
    errors: std::collections::HashMap<String, Vec<String>>,
) -> Result<(), AppError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ValidationErrors(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn blank_and_long_text_are_rejected() {
        let mut errors = HashMap::new();
        assert_eq!(required_text("title", "  Rust  ", 10, &mut errors), "Rust");
        assert!(errors.is_empty());

        required_text("title", "   ", 10, &mut errors);
        required_text("name", "a much too long value", 10, &mut errors);
        assert_eq!(errors["title"], vec!["This field may not be blank."]);
        assert!(errors["name"][0].contains("no more than 10"));
        assert!(finish_validation(errors).is_err());
    }

    #[test]
    fn choices_are_enforced() {
        let mut errors = HashMap::new();
        check_choice("level", "beginner", &["beginner", "advanced"], &mut errors);
        assert!(finish_validation(errors.clone()).is_ok());
        check_choice("level", "expert", &["beginner", "advanced"], &mut errors);
        assert_eq!(errors["level"], vec!["\"expert\" is not a valid choice."]);
    }

    #[tokio::test]
    async fn slow_queries_time_out() {
        let result: Result<(), AppError> = timeout_query(
            std::time::Duration::from_millis(10),
            async {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                Ok::<(), sqlx::Error>(())
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::Timeout(_))));
    }
}
