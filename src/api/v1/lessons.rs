use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::api::common::middleware::CurrentUser;
use crate::api::common::query::{
    fetch_page, fetch_scoped, FilterField, FilterKind, ListQuery, ListRules,
};
use crate::api::common::utils::{finish_validation, required_text};
use crate::api::common::{deserialize_some, ApiResponse, AppJson, PaginatedResponse};
use crate::api::v1::courses::{course_scope, fetch_visible_course, TITLE_MAX_LENGTH};
use crate::api::v1::profiles::url_problems;
use crate::api::v1::progress::refresh_completions;
use crate::errors::AppError;
use crate::InnerState;

const LESSON_COLUMNS: &str = "l.id, l.course_id, l.title, l.content, l.video_url, l.position, \
    l.duration_minutes, l.created_at, l.updated_at";
const LESSON_FROM: &str = "lessons l JOIN courses c ON c.id = l.course_id";

static LESSON_LIST: ListRules = ListRules {
    search_columns: &["l.title", "l.content"],
    ordering_fields: &[
        ("position", "l.position"),
        ("title", "l.title"),
        ("createdAt", "l.created_at"),
        ("id", "l.id"),
    ],
    filters: &[FilterField {
        param: "course",
        column: "l.course_id",
        kind: FilterKind::Integer,
    }],
    default_ordering: "l.course_id ASC, l.position ASC, l.id ASC",
};

#[derive(Debug, Serialize, FromRow, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub id: i64,
    pub course_id: i64,
    pub title: String,
    pub content: String,
    pub video_url: Option<String>,
    pub position: i64,
    pub duration_minutes: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLessonRequest {
    pub course_id: i64,
    pub title: String,
    pub content: Option<String>,
    pub video_url: Option<String>,
    pub position: Option<i64>,
    pub duration_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchLessonRequest {
    pub title: Option<String>,
    pub content: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub video_url: Option<Option<String>>,
    pub position: Option<i64>,
    pub duration_minutes: Option<i64>,
}

fn check_lesson_numbers(
    position: i64,
    duration_minutes: i64,
    errors: &mut HashMap<String, Vec<String>>,
) {
    if position < 0 {
        errors
            .entry("position".to_string())
            .or_default()
            .push("Ensure this value is greater than or equal to 0.".to_string());
    }
    if duration_minutes < 0 {
        errors
            .entry("durationMinutes".to_string())
            .or_default()
            .push("Ensure this value is greater than or equal to 0.".to_string());
    }
}

fn check_video_url(video_url: Option<&str>, errors: &mut HashMap<String, Vec<String>>) {
    if let Some(url) = video_url {
        let problems = url_problems(url);
        if !problems.is_empty() {
            errors.insert("videoUrl".to_string(), problems);
        }
    }
}

#[tracing::instrument(name = "Fetch lesson", skip(db, viewer))]
async fn fetch_lesson(
    db: &SqlitePool,
    lesson_id: i64,
    viewer: Option<&CurrentUser>,
) -> Result<Lesson, AppError> {
    fetch_scoped::<Lesson>(
        db,
        LESSON_COLUMNS,
        LESSON_FROM,
        "l.id",
        lesson_id,
        &course_scope(viewer),
    )
    .await?
    .ok_or_else(|| AppError::NotFound("Lesson not found".to_string()))
}

/// Lessons may only be changed by the instructor of their course or staff.
async fn ensure_course_owner(
    db: &SqlitePool,
    course_id: i64,
    user: &CurrentUser,
) -> Result<(), AppError> {
    let course = fetch_visible_course(db, course_id, Some(user)).await?;
    user.ensure_owner(course.instructor.id)
}

#[tracing::instrument(name = "List lessons", skip(inner, params, viewer))]
pub async fn list_lessons(
    viewer: Option<CurrentUser>,
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<Lesson>>, AppError> {
    let query = ListQuery::parse(&params, &LESSON_LIST)?;
    let page = fetch_page::<Lesson>(
        &inner.db,
        inner.settings.db_timeout,
        LESSON_COLUMNS,
        LESSON_FROM,
        &course_scope(viewer.as_ref()),
        &query,
    )
    .await?;
    Ok(Json(page))
}

#[tracing::instrument(name = "Get lesson", skip(inner, viewer))]
pub async fn get_lesson(
    viewer: Option<CurrentUser>,
    State(inner): State<InnerState>,
    Path(lesson_id): Path<i64>,
) -> Result<Json<ApiResponse<Lesson>>, AppError> {
    let lesson = fetch_lesson(&inner.db, lesson_id, viewer.as_ref()).await?;
    Ok(Json(ApiResponse::success(lesson)))
}

#[tracing::instrument(name = "Create lesson", skip(inner, payload), fields(caller = user.id, course = payload.course_id))]
pub async fn create_lesson(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CreateLessonRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Lesson>>), AppError> {
    let InnerState { db, .. } = inner;

    match ensure_course_owner(&db, payload.course_id, &user).await {
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
    }

    let mut transaction = db.begin().await?;
    let position = match payload.position {
        Some(position) => position,
        None => {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM lessons WHERE course_id = ?",
            )
            .bind(payload.course_id)
            .fetch_one(&mut *transaction)
            .await?
        }
    };
    let duration_minutes = payload.duration_minutes.unwrap_or(0);
    let video_url = payload
        .video_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let title = required_text("title", &payload.title, TITLE_MAX_LENGTH, &mut errors);
    check_lesson_numbers(position, duration_minutes, &mut errors);
    check_video_url(video_url.as_deref(), &mut errors);
    finish_validation(errors)?;

    let lesson_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO lessons (course_id, title, content, video_url, position, duration_minutes)
           VALUES (?, ?, ?, ?, ?, ?)
           RETURNING id"#,
    )
    .bind(payload.course_id)
    .bind(&title)
    .bind(payload.content.unwrap_or_default())
    .bind(&video_url)
    .bind(position)
    .bind(duration_minutes)
    .fetch_one(&mut *transaction)
    .await?;

    refresh_completions(&mut transaction, payload.course_id, None).await?;
    transaction.commit().await?;

    tracing::info!("Created lesson {} at position {}", lesson_id, position);
    let lesson = fetch_lesson(&db, lesson_id, Some(&user)).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(lesson))))
}

#[tracing::instrument(name = "Update lesson", skip(inner, payload), fields(caller = user.id))]
pub async fn update_lesson(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(lesson_id): Path<i64>,
    AppJson(payload): AppJson<PatchLessonRequest>,
) -> Result<Json<ApiResponse<Lesson>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_lesson(&db, lesson_id, Some(&user)).await?;
    ensure_course_owner(&db, existing.course_id, &user).await?;

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let title = match payload.title {
        Some(title) => required_text("title", &title, TITLE_MAX_LENGTH, &mut errors),
        None => existing.title,
    };
    let position = payload.position.unwrap_or(existing.position);
    let duration_minutes = payload.duration_minutes.unwrap_or(existing.duration_minutes);
    let video_url = match payload.video_url {
        Some(value) => value
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty()),
        None => existing.video_url,
    };
    check_lesson_numbers(position, duration_minutes, &mut errors);
    check_video_url(video_url.as_deref(), &mut errors);
    finish_validation(errors)?;

    sqlx::query(
        r#"UPDATE lessons
           SET title = ?, content = ?, video_url = ?, position = ?, duration_minutes = ?,
               updated_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(&title)
    .bind(payload.content.unwrap_or(existing.content))
    .bind(&video_url)
    .bind(position)
    .bind(duration_minutes)
    .bind(lesson_id)
    .execute(&db)
    .await?;

    tracing::info!("Updated lesson {}", lesson_id);
    let lesson = fetch_lesson(&db, lesson_id, Some(&user)).await?;
    Ok(Json(ApiResponse::success(lesson)))
}

#[tracing::instrument(name = "Delete lesson", skip(inner), fields(caller = user.id))]
pub async fn delete_lesson(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(lesson_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_lesson(&inner.db, lesson_id, Some(&user)).await?;
    ensure_course_owner(&inner.db, existing.course_id, &user).await?;

    let mut transaction = inner.db.begin().await?;
    sqlx::query("DELETE FROM lessons WHERE id = ?")
        .bind(lesson_id)
        .execute(&mut *transaction)
        .await?;
    refresh_completions(&mut transaction, existing.course_id, None).await?;
    transaction.commit().await?;

    tracing::info!("Deleted lesson {}", lesson_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_course, create_lesson as add_lesson, register, send, test_app};
    use axum::http::Method;
    use serde_json::json;

    #[tokio::test]
    async fn positions_default_to_the_end() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        add_lesson(&app, &ada.token, course, "Ownership").await;
        add_lesson(&app, &ada.token, course, "Borrowing").await;

        let (status, body) = send(
            &app,
            Method::GET,
            &format!("/api/v1/lessons?course={}", course),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["position"], 1);
        assert_eq!(body["data"][1]["position"], 2);
        assert_eq!(body["data"][1]["title"], "Borrowing");
    }

    #[tokio::test]
    async fn only_the_instructor_adds_lessons() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/lessons",
            Some(&grace.token),
            Some(json!({ "courseId": course, "title": "Sneaky" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/lessons",
            Some(&ada.token),
            Some(json!({ "courseId": 999, "title": "Lost" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"]["courseId"].is_array());
    }

    #[tokio::test]
    async fn lesson_numbers_are_validated() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/lessons",
            Some(&ada.token),
            Some(json!({
                "courseId": course,
                "title": "Ownership",
                "durationMinutes": -5,
                "videoUrl": "not a url"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"]["durationMinutes"].is_array());
        assert!(body["errors"]["videoUrl"].is_array());
    }

    #[tokio::test]
    async fn lessons_of_hidden_courses_are_hidden() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let course = create_course(&app, &ada.token, "Draft", false).await;
        let lesson = add_lesson(&app, &ada.token, course, "Secret").await;

        let uri = format!("/api/v1/lessons/{}", lesson);
        let (status, _) = send(&app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::GET, &uri, Some(&ada.token), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn course_delete_cascades_to_lessons() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let lesson = add_lesson(&app, &ada.token, course, "Ownership").await;

        let (status, body) = send(
            &app,
            Method::PATCH,
            &format!("/api/v1/lessons/{}", lesson),
            Some(&ada.token),
            Some(json!({ "title": "Ownership in depth", "durationMinutes": 45 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["durationMinutes"], 45);

        send(&app, Method::DELETE, &format!("/api/v1/courses/{}", course), Some(&ada.token), None).await;
        let (status, _) =
            send(&app, Method::GET, &format!("/api/v1/lessons/{}", lesson), None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
