use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::api::common::middleware::CurrentUser;
use crate::api::common::query::{
    fetch_page, fetch_scoped, FilterField, FilterKind, ListQuery, ListRules, Scope,
};
use crate::api::common::utils::finish_validation;
use crate::api::common::{ApiResponse, AppJson, PaginatedResponse};
use crate::errors::AppError;
use crate::InnerState;

pub const USERNAME_MAX_LENGTH: usize = 150;
pub const EMAIL_MAX_LENGTH: usize = 254;
const NAME_MAX_LENGTH: usize = 150;

const USER_COLUMNS: &str = "u.id, u.username, u.email, u.first_name, u.last_name, \
    u.is_staff, u.last_login, u.created_at, u.updated_at";
const USER_FROM: &str = "users u";

static USER_LIST: ListRules = ListRules {
    search_columns: &["u.username", "u.email", "u.first_name", "u.last_name"],
    ordering_fields: &[
        ("username", "u.username"),
        ("createdAt", "u.created_at"),
        ("id", "u.id"),
    ],
    filters: &[FilterField {
        param: "isStaff",
        column: "u.is_staff",
        kind: FilterKind::Boolean,
    }],
    default_ordering: "u.id ASC",
};

#[derive(Debug, Serialize, Deserialize, FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub is_staff: bool,
    pub last_login: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Compact user reference nested inside other resources.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: i64,
    pub username: String,
}

#[derive(Debug, FromRow)]
pub struct StoredUser {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub is_staff: bool,
}

pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchUserRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Letters, digits and `@.+-_`, as usernames have always been.
pub fn username_problems(username: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if username.is_empty() {
        problems.push("This field may not be blank.".to_string());
    } else if username.chars().count() > USERNAME_MAX_LENGTH {
        problems.push(format!(
            "Ensure this field has no more than {} characters.",
            USERNAME_MAX_LENGTH
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '@' | '.' | '+' | '-' | '_'))
    {
        problems.push(
            "Enter a valid username. This value may contain only letters, numbers, and @/./+/-/_ characters."
                .to_string(),
        );
    }
    problems
}

pub fn email_problems(email: &str) -> Vec<String> {
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    };
    let mut problems = Vec::new();
    if !valid {
        problems.push("Enter a valid email address.".to_string());
    }
    if email.chars().count() > EMAIL_MAX_LENGTH {
        problems.push(format!(
            "Ensure this field has no more than {} characters.",
            EMAIL_MAX_LENGTH
        ));
    }
    problems
}

pub fn name_problems(name: &str) -> Vec<String> {
    if name.chars().count() > NAME_MAX_LENGTH {
        vec![format!(
            "Ensure this field has no more than {} characters.",
            NAME_MAX_LENGTH
        )]
    } else {
        Vec::new()
    }
}

#[tracing::instrument(name = "Get stored credentials", skip(email, pool))]
pub async fn get_stored_credentials(
    email: &str,
    pool: &SqlitePool,
) -> Result<Option<StoredUser>, AppError> {
    let row = sqlx::query_as::<_, StoredUser>(
        r#"SELECT id, email, password_hash, is_staff FROM users WHERE email = ? COLLATE NOCASE"#,
    )
    .bind(email.trim())
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        AppError::Database(anyhow::Error::from(e).context("Failed to get stored credentials"))
    })?;

    Ok(row)
}

#[tracing::instrument(name = "Get stored credentials by id", skip(pool))]
pub async fn get_stored_credentials_by_id(
    user_id: i64,
    pool: &SqlitePool,
) -> Result<Option<StoredUser>, AppError> {
    let row = sqlx::query_as::<_, StoredUser>(
        r#"SELECT id, email, password_hash, is_staff FROM users WHERE id = ?"#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        AppError::Database(anyhow::Error::from(e).context("Failed to get stored credentials"))
    })?;

    Ok(row)
}

#[tracing::instrument(name = "Fetch user by id", skip(pool))]
pub async fn fetch_user(pool: &SqlitePool, user_id: i64) -> Result<User, AppError> {
    fetch_scoped::<User>(pool, USER_COLUMNS, USER_FROM, "u.id", user_id, &Scope::Everything)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
}

/// Fails with 409 when `username` or `email` already belongs to a user other than `except`.
async fn ensure_identity_available(
    conn: &mut SqliteConnection,
    username: &str,
    email: &str,
    except: Option<i64>,
) -> Result<(), AppError> {
    let taken: Option<(String, String)> = sqlx::query_as(
        r#"SELECT username, email FROM users
           WHERE (username = ? OR email = ? COLLATE NOCASE) AND id != ?
           LIMIT 1"#,
    )
    .bind(username)
    .bind(email)
    .bind(except.unwrap_or(-1))
    .fetch_optional(&mut *conn)
    .await?;

    match taken {
        Some((existing_username, _)) if existing_username == username => Err(AppError::Conflict(
            "A user with that username already exists.".to_string(),
        )),
        Some(_) => Err(AppError::Conflict(
            "A user with that email already exists.".to_string(),
        )),
        None => Ok(()),
    }
}

#[tracing::instrument(name = "Saving new user in the database", skip(new_user, transaction), fields(username = %new_user.username), err)]
pub async fn create_user(
    transaction: &mut Transaction<'_, Sqlite>,
    new_user: &NewUser,
) -> Result<i64, AppError> {
    ensure_identity_available(&mut **transaction, &new_user.username, &new_user.email, None)
        .await?;

    let user_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO users (username, email, password_hash, first_name, last_name)
           VALUES (?, ?, ?, ?, ?)
           RETURNING id"#,
    )
    .bind(&new_user.username)
    .bind(&new_user.email)
    .bind(&new_user.password_hash)
    .bind(&new_user.first_name)
    .bind(&new_user.last_name)
    .fetch_one(&mut **transaction)
    .await?;

    tracing::info!("Created user with id: {}", user_id);
    Ok(user_id)
}

#[tracing::instrument(name = "List users", skip(inner, params))]
pub async fn list_users(
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<User>>, AppError> {
    let query = ListQuery::parse(&params, &USER_LIST)?;
    let page = fetch_page::<User>(
        &inner.db,
        inner.settings.db_timeout,
        USER_COLUMNS,
        USER_FROM,
        &Scope::Everything,
        &query,
    )
    .await?;
    Ok(Json(page))
}

#[tracing::instrument(name = "Get user", skip(inner))]
pub async fn get_user(
    State(inner): State<InnerState>,
    Path(user_id): Path<i64>,
) -> Result<Json<ApiResponse<User>>, AppError> {
    let user = fetch_user(&inner.db, user_id).await?;
    Ok(Json(ApiResponse::success(user)))
}

#[tracing::instrument(name = "Update user", skip(inner, payload), fields(caller = user.id))]
pub async fn update_user(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(user_id): Path<i64>,
    AppJson(payload): AppJson<PatchUserRequest>,
) -> Result<Json<ApiResponse<User>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_user(&db, user_id).await?;
    user.ensure_owner(existing.id)?;

    let username = payload
        .username
        .map(|u| u.trim().to_string())
        .unwrap_or(existing.username);
    let email = payload
        .email
        .map(|e| e.trim().to_lowercase())
        .unwrap_or(existing.email);
    let first_name = payload
        .first_name
        .map(|n| n.trim().to_string())
        .unwrap_or(existing.first_name);
    let last_name = payload
        .last_name
        .map(|n| n.trim().to_string())
        .unwrap_or(existing.last_name);

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    for (field, problems) in [
        ("username", username_problems(&username)),
        ("email", email_problems(&email)),
        ("firstName", name_problems(&first_name)),
        ("lastName", name_problems(&last_name)),
    ] {
        if !problems.is_empty() {
            errors.insert(field.to_string(), problems);
        }
    }
    finish_validation(errors)?;

    {
        let mut conn = db.acquire().await?;
        ensure_identity_available(&mut conn, &username, &email, Some(user_id)).await?;
    }

    sqlx::query(
        r#"UPDATE users
           SET username = ?, email = ?, first_name = ?, last_name = ?, updated_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(&username)
    .bind(&email)
    .bind(&first_name)
    .bind(&last_name)
    .bind(user_id)
    .execute(&db)
    .await?;

    tracing::info!("Updated user {}", user_id);
    let updated = fetch_user(&db, user_id).await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// Deletes the account and, through cascades, everything it owns.
#[tracing::instrument(name = "Delete user", skip(inner), fields(caller = user.id))]
pub async fn delete_user(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(user_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_user(&inner.db, user_id).await?;
    user.ensure_owner(existing.id)?;

    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(&inner.db)
        .await?;

    tracing::info!("Deleted user {}", user_id);
    Ok(StatusCode::NO_CONTENT)
}
