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
use crate::api::common::utils::finish_validation;
use crate::api::common::{ApiResponse, AppJson, PaginatedResponse};
use crate::api::v1::courses::fetch_visible_course;
use crate::api::v1::users::UserSummary;
use crate::errors::AppError;
use crate::InnerState;

const COMMENT_MAX_LENGTH: usize = 2000;

const REVIEW_COLUMNS: &str = "r.id, r.student_id, u.username AS student_username, r.course_id, \
    r.rating, r.comment, r.created_at, r.updated_at";
const REVIEW_FROM: &str = "course_reviews r \
    JOIN users u ON u.id = r.student_id \
    JOIN courses c ON c.id = r.course_id";

static REVIEW_LIST: ListRules = ListRules {
    search_columns: &["r.comment"],
    ordering_fields: &[
        ("rating", "r.rating"),
        ("createdAt", "r.created_at"),
        ("id", "r.id"),
    ],
    filters: &[
        FilterField {
            param: "course",
            column: "r.course_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "student",
            column: "r.student_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "rating",
            column: "r.rating",
            kind: FilterKind::Integer,
        },
    ],
    default_ordering: "r.created_at DESC, r.id DESC",
};

#[derive(Debug, FromRow)]
struct ReviewRow {
    id: i64,
    student_id: i64,
    student_username: String,
    course_id: i64,
    rating: i64,
    comment: String,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CourseReview {
    pub id: i64,
    pub student: UserSummary,
    pub course_id: i64,
    pub rating: i64,
    pub comment: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<ReviewRow> for CourseReview {
    fn from(row: ReviewRow) -> Self {
        CourseReview {
            id: row.id,
            student: UserSummary {
                id: row.student_id,
                username: row.student_username,
            },
            course_id: row.course_id,
            rating: row.rating,
            comment: row.comment,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReviewRequest {
    pub course_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchReviewRequest {
    pub rating: Option<i64>,
    pub comment: Option<String>,
}

fn validate_review(rating: i64, comment: &str) -> Result<(), AppError> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    if !(1..=5).contains(&rating) {
        errors
            .entry("rating".to_string())
            .or_default()
            .push("Ensure this value is between 1 and 5.".to_string());
    }
    if comment.chars().count() > COMMENT_MAX_LENGTH {
        errors.entry("comment".to_string()).or_default().push(format!(
            "Ensure this field has no more than {} characters.",
            COMMENT_MAX_LENGTH
        ));
    }
    finish_validation(errors)
}

/// Reviews follow their course's visibility, except that authors keep
/// access to their own reviews once the course is unpublished.
fn review_scope(viewer: Option<&CurrentUser>) -> Scope {
    match viewer {
        Some(user) if user.is_staff => Scope::Everything,
        _ => Scope::Published {
            flag: "c.is_published",
            owners: &["c.instructor_id", "r.student_id"],
            viewer: viewer.map(|user| user.id),
        },
    }
}

#[tracing::instrument(name = "Fetch review", skip(db, viewer))]
async fn fetch_review(
    db: &SqlitePool,
    review_id: i64,
    viewer: Option<&CurrentUser>,
) -> Result<CourseReview, AppError> {
    fetch_scoped::<ReviewRow>(
        db,
        REVIEW_COLUMNS,
        REVIEW_FROM,
        "r.id",
        review_id,
        &review_scope(viewer),
    )
    .await?
    .map(CourseReview::from)
    .ok_or_else(|| AppError::NotFound("Review not found".to_string()))
}

#[tracing::instrument(name = "List reviews", skip(inner, params, viewer))]
pub async fn list_reviews(
    viewer: Option<CurrentUser>,
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<CourseReview>>, AppError> {
    let query = ListQuery::parse(&params, &REVIEW_LIST)?;
    let page = fetch_page::<ReviewRow>(
        &inner.db,
        inner.settings.db_timeout,
        REVIEW_COLUMNS,
        REVIEW_FROM,
        &review_scope(viewer.as_ref()),
        &query,
    )
    .await?;
    Ok(Json(page.map(CourseReview::from)))
}

#[tracing::instrument(name = "Get review", skip(inner, viewer))]
pub async fn get_review(
    viewer: Option<CurrentUser>,
    State(inner): State<InnerState>,
    Path(review_id): Path<i64>,
) -> Result<Json<ApiResponse<CourseReview>>, AppError> {
    let review = fetch_review(&inner.db, review_id, viewer.as_ref()).await?;
    Ok(Json(ApiResponse::success(review)))
}

/// Only students enrolled in the course may review it, once.
#[tracing::instrument(name = "Create review", skip(inner, payload), fields(student = user.id, course = payload.course_id))]
pub async fn create_review(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CreateReviewRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CourseReview>>), AppError> {
    let InnerState { db, .. } = inner;

    match fetch_visible_course(&db, payload.course_id, Some(&user)).await {
        Err(AppError::NotFound(_)) => {
            return Err(AppError::field(
                "courseId",
                format!(
                    "Invalid pk \"{}\" - object does not exist.",
                    payload.course_id
                ),
            ))
        }
        other => other?,
    };

    let comment = payload.comment.unwrap_or_default();
    validate_review(payload.rating, &comment)?;

    let enrolled: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?)",
    )
    .bind(user.id)
    .bind(payload.course_id)
    .fetch_one(&db)
    .await?;
    if !enrolled {
        tracing::warn!("Review attempt without enrollment");
        return Err(AppError::Permission(anyhow::anyhow!(
            "Only students enrolled in this course can review it."
        )));
    }

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM course_reviews WHERE student_id = ? AND course_id = ?)",
    )
    .bind(user.id)
    .bind(payload.course_id)
    .fetch_one(&db)
    .await?;
    if exists {
        return Err(AppError::Conflict(
            "You have already reviewed this course.".to_string(),
        ));
    }

    let review_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO course_reviews (student_id, course_id, rating, comment)
           VALUES (?, ?, ?, ?)
           RETURNING id"#,
    )
    .bind(user.id)
    .bind(payload.course_id)
    .bind(payload.rating)
    .bind(&comment)
    .fetch_one(&db)
    .await?;

    tracing::info!("Created review {}", review_id);
    let review = fetch_review(&db, review_id, Some(&user)).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(review))))
}

#[tracing::instrument(name = "Update review", skip(inner, payload), fields(caller = user.id))]
pub async fn update_review(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(review_id): Path<i64>,
    AppJson(payload): AppJson<PatchReviewRequest>,
) -> Result<Json<ApiResponse<CourseReview>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_review(&db, review_id, Some(&user)).await?;
    user.ensure_owner(existing.student.id)?;

    let rating = payload.rating.unwrap_or(existing.rating);
    let comment = payload.comment.unwrap_or(existing.comment);
    validate_review(rating, &comment)?;

    sqlx::query(
        "UPDATE course_reviews SET rating = ?, comment = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(rating)
    .bind(&comment)
    .bind(review_id)
    .execute(&db)
    .await?;

    tracing::info!("Updated review {}", review_id);
    let review = fetch_review(&db, review_id, Some(&user)).await?;
    Ok(Json(ApiResponse::success(review)))
}

#[tracing::instrument(name = "Delete review", skip(inner), fields(caller = user.id))]
pub async fn delete_review(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(review_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_review(&inner.db, review_id, Some(&user)).await?;
    user.ensure_owner(existing.student.id)?;

    sqlx::query("DELETE FROM course_reviews WHERE id = ?")
        .bind(review_id)
        .execute(&inner.db)
        .await?;

    tracing::info!("Deleted review {}", review_id);
    Ok(StatusCode::NO_CONTENT)
}
