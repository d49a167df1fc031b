use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::api::common::middleware::CurrentUser;
use crate::api::common::query::{
    fetch_page, fetch_scoped, FilterField, FilterKind, ListQuery, ListRules, Scope,
};
use crate::api::common::utils::{check_choice, finish_validation};
use crate::api::common::{deserialize_some, ApiResponse, AppJson, PaginatedResponse};
use crate::api::v1::users::UserSummary;
use crate::errors::AppError;
use crate::InnerState;

pub const PROFILE_ROLES: [&str; 2] = ["student", "instructor"];
const BIO_MAX_LENGTH: usize = 2000;
const URL_MAX_LENGTH: usize = 500;

const PROFILE_COLUMNS: &str = "p.id, p.user_id, u.username, p.role, p.bio, p.avatar_url, \
    p.created_at, p.updated_at";
const PROFILE_FROM: &str = "profiles p JOIN users u ON u.id = p.user_id";

static PROFILE_LIST: ListRules = ListRules {
    search_columns: &["p.bio", "u.username"],
    ordering_fields: &[
        ("createdAt", "p.created_at"),
        ("username", "u.username"),
        ("id", "p.id"),
    ],
    filters: &[
        FilterField {
            param: "role",
            column: "p.role",
            kind: FilterKind::Text,
        },
        FilterField {
            param: "user",
            column: "p.user_id",
            kind: FilterKind::Integer,
        },
    ],
    default_ordering: "p.id ASC",
};

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: i64,
    user_id: i64,
    username: String,
    role: String,
    bio: String,
    avatar_url: Option<String>,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: i64,
    pub user: UserSummary,
    pub role: String,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        Profile {
            id: row.id,
            user: UserSummary {
                id: row.user_id,
                username: row.username,
            },
            role: row.role,
            bio: row.bio,
            avatar_url: row.avatar_url,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProfileRequest {
    pub role: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchProfileRequest {
    pub role: Option<String>,
    pub bio: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub avatar_url: Option<Option<String>>,
}

/// Empty when `url` is an absolute http(s) URL of acceptable length.
pub fn url_problems(url: &str) -> Vec<String> {
    let mut problems = Vec::new();
    let has_host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .map(|rest| !rest.is_empty() && !rest.starts_with('/'))
        .unwrap_or(false);
    if !has_host || url.chars().any(char::is_whitespace) {
        problems.push("Enter a valid URL.".to_string());
    }
    if url.chars().count() > URL_MAX_LENGTH {
        problems.push(format!(
            "Ensure this field has no more than {} characters.",
            URL_MAX_LENGTH
        ));
    }
    problems
}

fn validate_profile(
    role: &str,
    bio: &str,
    avatar_url: Option<&str>,
) -> Result<(), AppError> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    check_choice("role", role, &PROFILE_ROLES, &mut errors);
    if bio.chars().count() > BIO_MAX_LENGTH {
        errors.entry("bio".to_string()).or_default().push(format!(
            "Ensure this field has no more than {} characters.",
            BIO_MAX_LENGTH
        ));
    }
    if let Some(url) = avatar_url {
        let problems = url_problems(url);
        if !problems.is_empty() {
            errors.insert("avatarUrl".to_string(), problems);
        }
    }
    finish_validation(errors)
}

#[tracing::instrument(name = "Fetch profile", skip(db))]
async fn fetch_profile(db: &SqlitePool, profile_id: i64) -> Result<Profile, AppError> {
    fetch_scoped::<ProfileRow>(
        db,
        PROFILE_COLUMNS,
        PROFILE_FROM,
        "p.id",
        profile_id,
        &Scope::Everything,
    )
    .await?
    .map(Profile::from)
    .ok_or_else(|| AppError::NotFound("Profile not found".to_string()))
}

#[tracing::instrument(name = "Fetch profile for user", skip(db))]
pub async fn fetch_profile_for_user(
    db: &SqlitePool,
    user_id: i64,
) -> Result<Option<Profile>, AppError> {
    let row = fetch_scoped::<ProfileRow>(
        db,
        PROFILE_COLUMNS,
        PROFILE_FROM,
        "p.user_id",
        user_id,
        &Scope::Everything,
    )
    .await?;
    Ok(row.map(Profile::from))
}

#[tracing::instrument(name = "List profiles", skip(inner, params))]
pub async fn list_profiles(
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<Profile>>, AppError> {
    let query = ListQuery::parse(&params, &PROFILE_LIST)?;
    let page = fetch_page::<ProfileRow>(
        &inner.db,
        inner.settings.db_timeout,
        PROFILE_COLUMNS,
        PROFILE_FROM,
        &Scope::Everything,
        &query,
    )
    .await?;
    Ok(Json(page.map(Profile::from)))
}

#[tracing::instrument(name = "Get profile", skip(inner))]
pub async fn get_profile(
    State(inner): State<InnerState>,
    Path(profile_id): Path<i64>,
) -> Result<Json<ApiResponse<Profile>>, AppError> {
    let profile = fetch_profile(&inner.db, profile_id).await?;
    Ok(Json(ApiResponse::success(profile)))
}

/// Creates the caller's own profile; each user has at most one.
#[tracing::instrument(name = "Create profile", skip(inner, payload), fields(user_id = user.id))]
pub async fn create_profile(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CreateProfileRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Profile>>), AppError> {
    let InnerState { db, .. } = inner;

    let role = payload.role.unwrap_or_else(|| "student".to_string());
    let bio = payload.bio.unwrap_or_default();
    let avatar_url = payload
        .avatar_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    validate_profile(&role, &bio, avatar_url.as_deref())?;

    if fetch_profile_for_user(&db, user.id).await?.is_some() {
        return Err(AppError::Conflict(
            "A profile already exists for this user.".to_string(),
        ));
    }

    let profile_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO profiles (user_id, role, bio, avatar_url)
           VALUES (?, ?, ?, ?)
           RETURNING id"#,
    )
    .bind(user.id)
    .bind(&role)
    .bind(&bio)
    .bind(&avatar_url)
    .fetch_one(&db)
    .await?;

    tracing::info!("Created profile {}", profile_id);
    let profile = fetch_profile(&db, profile_id).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(profile))))
}

#[tracing::instrument(name = "Update profile", skip(inner, payload), fields(caller = user.id))]
pub async fn update_profile(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(profile_id): Path<i64>,
    AppJson(payload): AppJson<PatchProfileRequest>,
) -> Result<Json<ApiResponse<Profile>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_profile(&db, profile_id).await?;
    user.ensure_owner(existing.user.id)?;

    let role = payload.role.unwrap_or(existing.role);
    let bio = payload.bio.unwrap_or(existing.bio);
    let avatar_url = match payload.avatar_url {
        Some(value) => value
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty()),
        None => existing.avatar_url,
    };
    validate_profile(&role, &bio, avatar_url.as_deref())?;

    sqlx::query(
        r#"UPDATE profiles
           SET role = ?, bio = ?, avatar_url = ?, updated_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(&role)
    .bind(&bio)
    .bind(&avatar_url)
    .bind(profile_id)
    .execute(&db)
    .await?;

    tracing::info!("Updated profile {}", profile_id);
    let profile = fetch_profile(&db, profile_id).await?;
    Ok(Json(ApiResponse::success(profile)))
}

#[tracing::instrument(name = "Delete profile", skip(inner), fields(caller = user.id))]
pub async fn delete_profile(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(profile_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_profile(&inner.db, profile_id).await?;
    user.ensure_owner(existing.user.id)?;

    sqlx::query("DELETE FROM profiles WHERE id = ?")
        .bind(profile_id)
        .execute(&inner.db)
        .await?;

    tracing::info!("Deleted profile {}", profile_id);
    Ok(StatusCode::NO_CONTENT)
}
