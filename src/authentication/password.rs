use crate::api::common::middleware::CurrentUser;
use crate::api::common::{ApiResponse, AppJson};
use crate::api::v1::users::{get_stored_credentials, get_stored_credentials_by_id};
use crate::errors::AppError;
use crate::InnerState;
use anyhow::Context;

use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher, PasswordVerifier, Version};
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::HashMap;

#[cfg(not(test))]
const HASH_MEMORY_KIB: u32 = 15000;
#[cfg(test)]
const HASH_MEMORY_KIB: u32 = 1024;

pub const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChange {
    pub current_password: String,
    pub new_password: String,
    pub new_password_confirmation: String,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Invalid credentials.")]
    InvalidCredentials(#[source] anyhow::Error),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}

/// Returns the id of the user owning `credentials`.
///
/// Unknown emails are still checked against a fallback hash so that the
/// response time does not reveal which accounts exist.
#[tracing::instrument(name = "Validate user credentials", skip(credentials, pool), fields(email = %credentials.email))]
pub async fn validate_credentials(
    credentials: &Credentials,
    pool: &SqlitePool,
) -> Result<i64, AuthError> {
    let mut user_id = None;
    let mut expected_password_hash = String::from(
        "$argon2id$v=19$m=15000,t=2,p=1$\
        gZiV/M1gPc22ElAH/Jh1Hw$\
        CWOrkoo7oJBQ/iyh7uJ0LO2aLEfrHwTWllSAxT0zRno",
    );

    match get_stored_credentials(&credentials.email, pool).await {
        Ok(Some(user)) => {
            tracing::debug!("User found with ID: {}", user.id);
            user_id = Some(user.id);
            expected_password_hash = user.password_hash;
        }
        Ok(None) => {
            tracing::warn!("No user registered with this email");
        }
        Err(error) => {
            tracing::error!("Failed to retrieve user credentials: {:?}", error);
            return Err(AuthError::UnexpectedError(anyhow::anyhow!(
                "Failed to retrieve stored credentials"
            )));
        }
    }

    verify_in_background(expected_password_hash, credentials.password.clone()).await?;

    user_id.ok_or_else(|| AuthError::InvalidCredentials(anyhow::anyhow!("Unknown email.")))
}

/// Checks `password` against the stored hash of `user_id`.
#[tracing::instrument(name = "Verify user password", skip(password, pool))]
pub async fn verify_user_password(
    user_id: i64,
    password: String,
    pool: &SqlitePool,
) -> Result<(), AuthError> {
    let stored = get_stored_credentials_by_id(user_id, pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to retrieve user credentials: {:?}", e);
            AuthError::UnexpectedError(anyhow::anyhow!("Failed to retrieve stored credentials"))
        })?
        .ok_or_else(|| AuthError::InvalidCredentials(anyhow::anyhow!("Unknown user.")))?;

    verify_in_background(stored.password_hash, password).await
}

/// Argon2 is CPU-bound, so it runs on the blocking pool.
async fn verify_in_background(
    expected_password_hash: String,
    password_candidate: String,
) -> Result<(), AuthError> {
    let current_span = tracing::Span::current();
    tokio::task::spawn_blocking(move || {
        current_span
            .in_scope(|| verify_password_hash(&expected_password_hash, &password_candidate))
    })
    .await
    .context("Failed to spawn blocking task.")?
}

#[tracing::instrument(
    name = "Verify password hash",
    skip(expected_password_hash, password_candidate)
)]
fn verify_password_hash(
    expected_password_hash: &str,
    password_candidate: &str,
) -> Result<(), AuthError> {
    let expected_password_hash = PasswordHash::new(expected_password_hash)
        .context("Failed to parse hash in PHC string format.")?;

    Argon2::default()
        .verify_password(password_candidate.as_bytes(), &expected_password_hash)
        .context("Invalid password.")
        .map_err(AuthError::InvalidCredentials)
}

#[tracing::instrument(name = "Compute password hash", skip(password))]
pub async fn compute_password_hash(password: String) -> Result<String, AppError> {
    let current_span = tracing::Span::current();
    tokio::task::spawn_blocking(move || current_span.in_scope(|| hash_password(&password)))
        .await
        .map_err(|e| {
            AppError::Unexpected(anyhow::Error::new(e).context("Failed to spawn blocking task"))
        })?
}

fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut rand::thread_rng());

    let params = Params::new(HASH_MEMORY_KIB, 2, 1, None).map_err(|e| {
        tracing::error!("Failed to create Argon2 parameters: {:?}", e);
        AppError::Unexpected(anyhow::anyhow!(e).context("Failed to create Argon2 params"))
    })?;

    let password_hash = Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| {
            tracing::error!("Failed to hash password: {:?}", e);
            AppError::Unexpected(anyhow::anyhow!(e).context("Failed to hash password"))
        })?
        .to_string();

    Ok(password_hash)
}

/// Messages describing why `password` is not acceptable; empty when it is.
pub fn password_problems(password: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        problems.push(format!(
            "This password is too short. It must contain at least {} characters.",
            MIN_PASSWORD_LENGTH
        ));
    }
    if !password.is_empty() && password.chars().all(|c| c.is_ascii_digit()) {
        problems.push("This password is entirely numeric.".to_string());
    }
    problems
}

#[tracing::instrument(name = "Change user password", skip(inner, password_change), fields(user_id = user.id))]
pub async fn change_password(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(password_change): AppJson<PasswordChange>,
) -> Result<Json<ApiResponse<()>>, AppError> {
    let InnerState { db, .. } = inner;

    verify_user_password(user.id, password_change.current_password, &db)
        .await
        .map_err(|e| match e {
            AuthError::InvalidCredentials(_) => AppError::field(
                "currentPassword",
                "Your current password was entered incorrectly.",
            ),
            other => other.into(),
        })?;

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let problems = password_problems(&password_change.new_password);
    if !problems.is_empty() {
        errors.insert("newPassword".to_string(), problems);
    }
    if password_change.new_password != password_change.new_password_confirmation {
        errors.insert(
            "newPasswordConfirmation".to_string(),
            vec!["The two password fields didn't match.".to_string()],
        );
    }
    if !errors.is_empty() {
        return Err(AppError::ValidationErrors(errors));
    }

    let password_hash = compute_password_hash(password_change.new_password).await?;

    sqlx::query("UPDATE users SET password_hash = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(&password_hash)
        .bind(user.id)
        .execute(&db)
        .await?;

    tracing::info!("Password changed for user {} ({})", user.id, user.email);
    Ok(Json(ApiResponse::message("Password changed")))
}
