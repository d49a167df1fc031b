use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::api::common::middleware::CurrentUser;
use crate::api::common::query::{fetch_page, fetch_scoped, ListQuery, ListRules, Scope};
use crate::api::common::utils::{finish_validation, required_text};
use crate::api::common::{ApiResponse, AppJson, PaginatedResponse};
use crate::errors::AppError;
use crate::InnerState;

const NAME_MAX_LENGTH: usize = 100;
const SLUG_MAX_LENGTH: usize = 100;

// Only published courses are counted.
const CATEGORY_COLUMNS: &str = "cat.id, cat.name, cat.slug, cat.description, cat.created_at, \
    (SELECT COUNT(*) FROM courses co WHERE co.category_id = cat.id AND co.is_published = 1) AS course_count";
const CATEGORY_FROM: &str = "categories cat";

static CATEGORY_LIST: ListRules = ListRules {
    search_columns: &["cat.name", "cat.description"],
    ordering_fields: &[
        ("name", "cat.name"),
        ("createdAt", "cat.created_at"),
        ("id", "cat.id"),
    ],
    filters: &[],
    default_ordering: "cat.name ASC, cat.id ASC",
};

#[derive(Debug, Serialize, FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub created_at: NaiveDateTime,
    pub course_count: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryRequest {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
}

/// Lowercases `name` and joins its alphanumeric runs with hyphens.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

fn slug_problems(slug: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if slug.is_empty()
        || !slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        problems.push(
            "Enter a valid slug consisting of lowercase letters, numbers or hyphens.".to_string(),
        );
    }
    if slug.chars().count() > SLUG_MAX_LENGTH {
        problems.push(format!(
            "Ensure this field has no more than {} characters.",
            SLUG_MAX_LENGTH
        ));
    }
    problems
}

/// Resolves the final `(name, slug, description)` of a create or update.
fn prepare(
    payload: CategoryRequest,
    existing: Option<&Category>,
) -> Result<(String, String, String), AppError> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();

    let raw_name = match (&payload.name, existing) {
        (Some(name), _) => name.clone(),
        (None, Some(category)) => category.name.clone(),
        (None, None) => String::new(),
    };
    let name = required_text("name", &raw_name, NAME_MAX_LENGTH, &mut errors);

    let slug = match (payload.slug, existing) {
        (Some(slug), _) if !slug.trim().is_empty() => slug.trim().to_string(),
        // A renamed category without an explicit slug keeps its old one.
        (_, Some(category)) => category.slug.clone(),
        (_, None) => slugify(&name),
    };
    let problems = slug_problems(&slug);
    if !problems.is_empty() && !errors.contains_key("name") {
        errors.insert("slug".to_string(), problems);
    }

    let description = payload
        .description
        .or_else(|| existing.map(|category| category.description.clone()))
        .unwrap_or_default();

    finish_validation(errors)?;
    Ok((name, slug, description))
}

#[tracing::instrument(name = "Fetch category", skip(db))]
pub async fn fetch_category(db: &SqlitePool, category_id: i64) -> Result<Category, AppError> {
    fetch_scoped::<Category>(
        db,
        CATEGORY_COLUMNS,
        CATEGORY_FROM,
        "cat.id",
        category_id,
        &Scope::Everything,
    )
    .await?
    .ok_or_else(|| AppError::NotFound("Category not found".to_string()))
}

#[tracing::instrument(name = "List categories", skip(inner, params))]
pub async fn list_categories(
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<Category>>, AppError> {
    let query = ListQuery::parse(&params, &CATEGORY_LIST)?;
    let page = fetch_page::<Category>(
        &inner.db,
        inner.settings.db_timeout,
        CATEGORY_COLUMNS,
        CATEGORY_FROM,
        &Scope::Everything,
        &query,
    )
    .await?;
    Ok(Json(page))
}

#[tracing::instrument(name = "Get category", skip(inner))]
pub async fn get_category(
    State(inner): State<InnerState>,
    Path(category_id): Path<i64>,
) -> Result<Json<ApiResponse<Category>>, AppError> {
    let category = fetch_category(&inner.db, category_id).await?;
    Ok(Json(ApiResponse::success(category)))
}

#[tracing::instrument(name = "Create category", skip(inner, payload), fields(caller = user.id))]
pub async fn create_category(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CategoryRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Category>>), AppError> {
    user.ensure_staff()?;
    let (name, slug, description) = prepare(payload, None)?;

    let category_id: i64 = sqlx::query_scalar(
        "INSERT INTO categories (name, slug, description) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(&name)
    .bind(&slug)
    .bind(&description)
    .fetch_one(&inner.db)
    .await?;

    tracing::info!("Created category {} ({})", category_id, slug);
    let category = fetch_category(&inner.db, category_id).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(category))))
}

#[tracing::instrument(name = "Update category", skip(inner, payload), fields(caller = user.id))]
pub async fn update_category(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(category_id): Path<i64>,
    AppJson(payload): AppJson<CategoryRequest>,
) -> Result<Json<ApiResponse<Category>>, AppError> {
    user.ensure_staff()?;
    let existing = fetch_category(&inner.db, category_id).await?;
    let (name, slug, description) = prepare(payload, Some(&existing))?;

    sqlx::query("UPDATE categories SET name = ?, slug = ?, description = ? WHERE id = ?")
        .bind(&name)
        .bind(&slug)
        .bind(&description)
        .bind(category_id)
        .execute(&inner.db)
        .await?;

    tracing::info!("Updated category {}", category_id);
    let category = fetch_category(&inner.db, category_id).await?;
    Ok(Json(ApiResponse::success(category)))
}

/// Courses in the category keep existing with no category.
#[tracing::instrument(name = "Delete category", skip(inner), fields(caller = user.id))]
pub async fn delete_category(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(category_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    user.ensure_staff()?;
    fetch_category(&inner.db, category_id).await?;

    sqlx::query("DELETE FROM categories WHERE id = ?")
        .bind(category_id)
        .execute(&inner.db)
        .await?;

    tracing::info!("Deleted category {}", category_id);
    Ok(StatusCode::NO_CONTENT)
}
