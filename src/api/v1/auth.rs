use std::collections::HashMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tower_cookies::Cookies;

use crate::api::common::middleware::CurrentUser;
use crate::api::common::utils::{clear_auth_cookie, finish_validation, setup_auth_cookie};
use crate::api::common::{ApiResponse, AppJson};
use crate::api::v1::profiles::{fetch_profile_for_user, Profile};
use crate::api::v1::users::{
    create_user, email_problems, fetch_user, name_problems, username_problems, NewUser, User,
};
use crate::authentication::{compute_password_hash, password_problems, validate_credentials, Credentials};
use crate::config::Settings;
use crate::errors::AppError;
use crate::InnerState;

pub const AUTH_COOKIE: &str = "auth-token";

const STAFF_ROLE: &str = "staff";
const USER_ROLE: &str = "user";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub sub: String,
    pub user_id: i64,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn is_staff(&self) -> bool {
        self.role == STAFF_ROLE
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub user: User,
    pub profile: Option<Profile>,
}

#[tracing::instrument(name = "Generate JWT token", skip(email, settings), fields(user_id = user_id))]
pub fn generate_token(
    email: &str,
    user_id: i64,
    is_staff: bool,
    settings: &Settings,
) -> Result<String, AppError> {
    let claims = Claims {
        sub: email.to_owned(),
        user_id,
        role: if is_staff { STAFF_ROLE } else { USER_ROLE }.to_owned(),
        exp: (chrono::Utc::now() + chrono::Duration::days(settings.token_ttl_days)).timestamp()
            as usize,
    };

    let header = Header::new(Algorithm::HS256);
    let key = EncodingKey::from_secret(settings.secret_token.expose_secret().as_bytes());
    encode(&header, &claims, &key).map_err(|e| {
        tracing::error!("Failed to encode JWT token for user {}: {:?}", user_id, e);
        AppError::Unexpected(anyhow::Error::new(e).context("Failed to encode JWT token"))
    })
}

/// Verifies signature and expiry. Any failure is a 401.
pub fn decode_token(token: &str, settings: &Settings) -> Result<Claims, AppError> {
    let key = DecodingKey::from_secret(settings.secret_token.expose_secret().as_bytes());
    decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256))
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::warn!("Rejected token: {:?}", e);
            AppError::Authentication(anyhow::anyhow!("Invalid or expired token."))
        })
}

#[tracing::instrument(name = "Register user", skip(inner, payload), fields(username = %payload.username))]
pub async fn register(
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<RegisterRequest>,
) -> Result<(StatusCode, Json<ApiResponse<User>>), AppError> {
    let InnerState { db, settings } = inner;

    let username = payload.username.trim().to_string();
    let email = payload.email.trim().to_lowercase();
    let is_admin = settings.admin_email.as_deref() == Some(email.as_str());
    let first_name = payload.first_name.unwrap_or_default().trim().to_string();
    let last_name = payload.last_name.unwrap_or_default().trim().to_string();

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    for (field, problems) in [
        ("username", username_problems(&username)),
        ("email", email_problems(&email)),
        ("password", password_problems(&payload.password)),
        ("firstName", name_problems(&first_name)),
        ("lastName", name_problems(&last_name)),
    ] {
        if !problems.is_empty() {
            errors.insert(field.to_string(), problems);
        }
    }
    finish_validation(errors)?;

    let password_hash = compute_password_hash(payload.password).await?;

    let mut transaction = db.begin().await?;
    let user_id = create_user(
        &mut transaction,
        &NewUser {
            username,
            email,
            password_hash,
            first_name,
            last_name,
        },
    )
    .await?;
    sqlx::query("INSERT INTO profiles (user_id, role) VALUES (?, 'student')")
        .bind(user_id)
        .execute(&mut *transaction)
        .await?;
    if is_admin {
        sqlx::query("UPDATE users SET is_staff = 1 WHERE id = ?")
            .bind(user_id)
            .execute(&mut *transaction)
            .await?;
        tracing::info!("Granted staff rights to user {}", user_id);
    }
    transaction.commit().await?;

    tracing::info!("Registered user {}", user_id);
    let user = fetch_user(&db, user_id).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(user))))
}

#[tracing::instrument(name = "User login", skip(cookies, inner, credentials), fields(email = %credentials.email))]
pub async fn login(
    cookies: Cookies,
    State(inner): State<InnerState>,
    AppJson(credentials): AppJson<Credentials>,
) -> Result<Json<ApiResponse<LoginResponse>>, AppError> {
    let InnerState { db, settings } = inner;

    let user_id = validate_credentials(&credentials, &db).await?;

    sqlx::query("UPDATE users SET last_login = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(user_id)
        .execute(&db)
        .await?;
    let user = fetch_user(&db, user_id).await?;

    let token = generate_token(&user.email, user.id, user.is_staff, &settings)?;
    setup_auth_cookie(&token, &settings, &cookies);

    tracing::info!("Login completed for user {}", user.id);
    Ok(Json(ApiResponse::success(LoginResponse { token, user })))
}

#[tracing::instrument(name = "User logout", skip(cookies))]
pub async fn logout(cookies: Cookies) -> Json<ApiResponse<()>> {
    clear_auth_cookie(&cookies);
    Json(ApiResponse::message("Logged out"))
}

#[tracing::instrument(name = "Current user", skip(inner), fields(user_id = user.id))]
pub async fn me(
    user: CurrentUser,
    State(inner): State<InnerState>,
) -> Result<Json<ApiResponse<MeResponse>>, AppError> {
    let current = fetch_user(&inner.db, user.id).await?;
    let profile = fetch_profile_for_user(&inner.db, user.id).await?;
    Ok(Json(ApiResponse::success(MeResponse {
        user: current,
        profile,
    })))
}
