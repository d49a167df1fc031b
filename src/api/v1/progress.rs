use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::api::common::middleware::CurrentUser;
use crate::api::common::query::{
    fetch_page, fetch_scoped, FilterField, FilterKind, ListQuery, ListRules, Scope,
};
use crate::api::common::{ApiResponse, AppJson, PaginatedResponse};
use crate::api::v1::users::UserSummary;
use crate::errors::AppError;
use crate::InnerState;

const PROGRESS_COLUMNS: &str = "lp.id, lp.student_id, u.username AS student_username, \
    lp.lesson_id, l.title AS lesson_title, l.course_id, lp.progress_percent, lp.completed, \
    lp.completed_at, lp.updated_at";
const PROGRESS_FROM: &str = "lesson_progress lp \
    JOIN users u ON u.id = lp.student_id \
    JOIN lessons l ON l.id = lp.lesson_id \
    JOIN courses c ON c.id = l.course_id";

static PROGRESS_LIST: ListRules = ListRules {
    search_columns: &[],
    ordering_fields: &[
        ("updatedAt", "lp.updated_at"),
        ("progressPercent", "lp.progress_percent"),
        ("id", "lp.id"),
    ],
    filters: &[
        FilterField {
            param: "lesson",
            column: "lp.lesson_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "course",
            column: "l.course_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "completed",
            column: "lp.completed",
            kind: FilterKind::Boolean,
        },
    ],
    default_ordering: "lp.updated_at DESC, lp.id DESC",
};

/// An enrollment is complete once its course has lessons and the student
/// finished every one of them. Evaluated against the `enrollments` row being
/// updated.
const ENROLLMENT_COMPLETE: &str = "(SELECT COUNT(*) FROM lessons WHERE course_id = enrollments.course_id) > 0 \
    AND NOT EXISTS ( \
        SELECT 1 FROM lessons l \
        WHERE l.course_id = enrollments.course_id \
        AND NOT EXISTS ( \
            SELECT 1 FROM lesson_progress lp \
            WHERE lp.lesson_id = l.id AND lp.student_id = enrollments.student_id AND lp.completed = 1 \
        ) \
    )";

/// Own progress plus progress in courses the caller teaches; staff see all.
fn progress_scope(user: &CurrentUser) -> Scope {
    if user.is_staff {
        Scope::Everything
    } else {
        Scope::Related {
            columns: &["lp.student_id", "c.instructor_id"],
            user_id: user.id,
        }
    }
}

#[derive(Debug, FromRow)]
struct ProgressRow {
    id: i64,
    student_id: i64,
    student_username: String,
    lesson_id: i64,
    lesson_title: String,
    course_id: i64,
    progress_percent: i64,
    completed: bool,
    completed_at: Option<NaiveDateTime>,
    updated_at: NaiveDateTime,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LessonProgress {
    pub id: i64,
    pub student: UserSummary,
    pub lesson_id: i64,
    pub lesson_title: String,
    pub course_id: i64,
    pub progress_percent: i64,
    pub completed: bool,
    pub completed_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

impl From<ProgressRow> for LessonProgress {
    fn from(row: ProgressRow) -> Self {
        LessonProgress {
            id: row.id,
            student: UserSummary {
                id: row.student_id,
                username: row.student_username,
            },
            lesson_id: row.lesson_id,
            lesson_title: row.lesson_title,
            course_id: row.course_id,
            progress_percent: row.progress_percent,
            completed: row.completed,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProgressRequest {
    pub lesson_id: i64,
    pub progress_percent: Option<i64>,
    pub completed: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchProgressRequest {
    pub progress_percent: Option<i64>,
    pub completed: Option<bool>,
}

fn check_percent(percent: i64) -> Result<(), AppError> {
    if (0..=100).contains(&percent) {
        Ok(())
    } else {
        Err(AppError::field(
            "progressPercent",
            "Ensure this value is between 0 and 100.",
        ))
    }
}

/// Final `(percent, completed)` pair: completion forces 100 and 100 implies completion.
fn settle(percent: i64, completed: bool) -> (i64, bool) {
    if completed || percent == 100 {
        (100, true)
    } else {
        (percent, false)
    }
}

/// Recomputes `completed` for the enrollments in `course_id`, or only the one
/// of `student_id` when given. Runs on the caller's connection so it commits
/// together with the write that triggered it.
#[tracing::instrument(name = "Refresh enrollment completion", skip(conn))]
pub async fn refresh_completions(
    conn: &mut SqliteConnection,
    course_id: i64,
    student_id: Option<i64>,
) -> Result<(), AppError> {
    let sql = format!(
        "UPDATE enrollments \
         SET completed = CASE WHEN {cond} THEN 1 ELSE 0 END, \
             completed_at = CASE WHEN {cond} THEN COALESCE(completed_at, CURRENT_TIMESTAMP) ELSE NULL END \
         WHERE course_id = ? AND (? IS NULL OR student_id = ?)",
        cond = ENROLLMENT_COMPLETE
    );
    let result = sqlx::query(&sql)
        .bind(course_id)
        .bind(student_id)
        .bind(student_id)
        .execute(&mut *conn)
        .await?;

    tracing::debug!("Refreshed {} enrollment(s)", result.rows_affected());
    Ok(())
}

#[tracing::instrument(name = "Fetch progress", skip(db, user))]
async fn fetch_progress(
    db: &SqlitePool,
    progress_id: i64,
    user: &CurrentUser,
) -> Result<LessonProgress, AppError> {
    fetch_scoped::<ProgressRow>(
        db,
        PROGRESS_COLUMNS,
        PROGRESS_FROM,
        "lp.id",
        progress_id,
        &progress_scope(user),
    )
    .await?
    .map(LessonProgress::from)
    .ok_or_else(|| AppError::NotFound("Progress not found".to_string()))
}

#[tracing::instrument(name = "List progress", skip(inner, params), fields(caller = user.id))]
pub async fn list_progress(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<LessonProgress>>, AppError> {
    let query = ListQuery::parse(&params, &PROGRESS_LIST)?;
    let page = fetch_page::<ProgressRow>(
        &inner.db,
        inner.settings.db_timeout,
        PROGRESS_COLUMNS,
        PROGRESS_FROM,
        &progress_scope(&user),
        &query,
    )
    .await?;
    Ok(Json(page.map(LessonProgress::from)))
}

#[tracing::instrument(name = "Get progress", skip(inner), fields(caller = user.id))]
pub async fn get_progress(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(progress_id): Path<i64>,
) -> Result<Json<ApiResponse<LessonProgress>>, AppError> {
    let progress = fetch_progress(&inner.db, progress_id, &user).await?;
    Ok(Json(ApiResponse::success(progress)))
}

#[tracing::instrument(name = "Create progress", skip(inner, payload), fields(student = user.id, lesson = payload.lesson_id))]
pub async fn create_progress(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CreateProgressRequest>,
) -> Result<(StatusCode, Json<ApiResponse<LessonProgress>>), AppError> {
    let InnerState { db, .. } = inner;

    let course_id: Option<i64> = sqlx::query_scalar("SELECT course_id FROM lessons WHERE id = ?")
        .bind(payload.lesson_id)
        .fetch_optional(&db)
        .await?;
    let course_id = course_id.ok_or_else(|| {
        AppError::field(
            "lessonId",
            format!(
                "Invalid pk \"{}\" - object does not exist.",
                payload.lesson_id
            ),
        )
    })?;

    let enrolled: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?)",
    )
    .bind(user.id)
    .bind(course_id)
    .fetch_one(&db)
    .await?;
    if !enrolled {
        return Err(AppError::field(
            "lessonId",
            "You must be enrolled in this lesson's course.",
        ));
    }

    let percent = payload.progress_percent.unwrap_or(0);
    check_percent(percent)?;
    let (percent, completed) = settle(percent, payload.completed.unwrap_or(false));

    let mut transaction = db.begin().await?;
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM lesson_progress WHERE student_id = ? AND lesson_id = ?)",
    )
    .bind(user.id)
    .bind(payload.lesson_id)
    .fetch_one(&mut *transaction)
    .await?;
    if exists {
        return Err(AppError::Conflict(
            "Progress for this lesson already exists.".to_string(),
        ));
    }

    let progress_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO lesson_progress (student_id, lesson_id, progress_percent, completed, completed_at)
           VALUES (?, ?, ?, ?, CASE WHEN ? THEN CURRENT_TIMESTAMP ELSE NULL END)
           RETURNING id"#,
    )
    .bind(user.id)
    .bind(payload.lesson_id)
    .bind(percent)
    .bind(completed)
    .bind(completed)
    .fetch_one(&mut *transaction)
    .await?;

    refresh_completions(&mut transaction, course_id, Some(user.id)).await?;
    transaction.commit().await?;

    tracing::info!("Recorded progress {} at {}%", progress_id, percent);
    let progress = fetch_progress(&db, progress_id, &user).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(progress))))
}

#[tracing::instrument(name = "Update progress", skip(inner, payload), fields(caller = user.id))]
pub async fn update_progress(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(progress_id): Path<i64>,
    AppJson(payload): AppJson<PatchProgressRequest>,
) -> Result<Json<ApiResponse<LessonProgress>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_progress(&db, progress_id, &user).await?;
    user.ensure_owner(existing.student.id)?;

    let percent = payload.progress_percent.unwrap_or(existing.progress_percent);
    check_percent(percent)?;
    // An explicit percent below 100 reopens the lesson unless completion is also sent.
    let completed = payload.completed.unwrap_or(match payload.progress_percent {
        Some(_) => false,
        None => existing.completed,
    });
    let (percent, completed) = settle(percent, completed);

    let mut transaction = db.begin().await?;
    sqlx::query(
        r#"UPDATE lesson_progress
           SET progress_percent = ?, completed = ?,
               completed_at = CASE WHEN ? THEN COALESCE(completed_at, CURRENT_TIMESTAMP) ELSE NULL END,
               updated_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(percent)
    .bind(completed)
    .bind(completed)
    .bind(progress_id)
    .execute(&mut *transaction)
    .await?;

    refresh_completions(&mut transaction, existing.course_id, Some(existing.student.id)).await?;
    transaction.commit().await?;

    tracing::info!("Updated progress {} to {}%", progress_id, percent);
    let progress = fetch_progress(&db, progress_id, &user).await?;
    Ok(Json(ApiResponse::success(progress)))
}

#[tracing::instrument(name = "Delete progress", skip(inner), fields(caller = user.id))]
pub async fn delete_progress(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(progress_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_progress(&inner.db, progress_id, &user).await?;
    user.ensure_owner(existing.student.id)?;

    let mut transaction = inner.db.begin().await?;
    sqlx::query("DELETE FROM lesson_progress WHERE id = ?")
        .bind(progress_id)
        .execute(&mut *transaction)
        .await?;
    refresh_completions(&mut transaction, existing.course_id, Some(existing.student.id)).await?;
    transaction.commit().await?;

    tracing::info!("Deleted progress {}", progress_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_course, create_lesson, enroll, register, send, test_app};
    use axum::http::Method;
    use serde_json::json;

    #[test]
    fn completion_and_full_percent_go_together() {
        assert_eq!(settle(40, false), (40, false));
        assert_eq!(settle(40, true), (100, true));
        assert_eq!(settle(100, false), (100, true));
        assert!(check_percent(0).is_ok());
        assert!(check_percent(100).is_ok());
        assert!(check_percent(101).is_err());
        assert!(check_percent(-1).is_err());
    }

    async fn enrollment_completed(app: &axum::Router, token: &str, course: i64) -> bool {
        let (_, body) = send(
            app,
            Method::GET,
            &format!("/api/v1/enrollments?course={}", course),
            Some(token),
            None,
        )
        .await;
        body["data"][0]["completed"].as_bool().unwrap()
    }

    #[tokio::test]
    async fn progress_requires_enrollment() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let lesson = create_lesson(&app, &ada.token, course, "Ownership").await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": lesson, "progressPercent": 10 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"]["lessonId"].is_array());
    }

    #[tokio::test]
    async fn percent_is_bounded_and_unique_per_lesson() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let lesson = create_lesson(&app, &ada.token, course, "Ownership").await;
        enroll(&app, &grace.token, course).await;

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": lesson, "progressPercent": 120 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": lesson, "progressPercent": 30 })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["completed"], false);
        assert!(body["data"]["completedAt"].is_null());

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": lesson })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn finishing_every_lesson_completes_the_enrollment() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let first = create_lesson(&app, &ada.token, course, "Ownership").await;
        let second = create_lesson(&app, &ada.token, course, "Borrowing").await;
        enroll(&app, &grace.token, course).await;

        let (_, body) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": first, "completed": true })),
        )
        .await;
        assert_eq!(body["data"]["progressPercent"], 100);
        assert!(!enrollment_completed(&app, &grace.token, course).await);

        let (_, body) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": second, "progressPercent": 50 })),
        )
        .await;
        let progress_id = body["data"]["id"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            Method::PATCH,
            &format!("/api/v1/progress/{}", progress_id),
            Some(&grace.token),
            Some(json!({ "progressPercent": 100 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["completed"], true);
        assert!(enrollment_completed(&app, &grace.token, course).await);

        // A new lesson reopens the course.
        create_lesson(&app, &ada.token, course, "Lifetimes").await;
        assert!(!enrollment_completed(&app, &grace.token, course).await);
    }

    #[tokio::test]
    async fn instructors_see_progress_in_their_courses_only() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let linus = register(&app, "linus").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let lesson = create_lesson(&app, &ada.token, course, "Ownership").await;
        enroll(&app, &grace.token, course).await;
        let (_, body) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": lesson, "progressPercent": 10 })),
        )
        .await;
        let progress_id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = send(&app, Method::GET, "/api/v1/progress", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (_, body) = send(&app, Method::GET, "/api/v1/progress", Some(&ada.token), None).await;
        assert_eq!(body["pagination"]["total"], 1);
        let (_, body) = send(&app, Method::GET, "/api/v1/progress", Some(&linus.token), None).await;
        assert_eq!(body["pagination"]["total"], 0);

        let uri = format!("/api/v1/progress/{}", progress_id);
        let (status, _) = send(
            &app,
            Method::PATCH,
            &uri,
            Some(&ada.token),
            Some(json!({ "progressPercent": 90 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, Method::DELETE, &uri, Some(&linus.token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, Method::DELETE, &uri, Some(&grace.token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn deleting_the_unfinished_lesson_completes_the_enrollment() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let first = create_lesson(&app, &ada.token, course, "Ownership").await;
        let second = create_lesson(&app, &ada.token, course, "Borrowing").await;
        enroll(&app, &grace.token, course).await;

        send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": first, "completed": true })),
        )
        .await;
        assert!(!enrollment_completed(&app, &grace.token, course).await);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/api/v1/lessons/{}", second),
            Some(&ada.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(enrollment_completed(&app, &grace.token, course).await);
    }

    #[tokio::test]
    async fn deleting_progress_reopens_the_enrollment() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let lesson = create_lesson(&app, &ada.token, course, "Ownership").await;
        enroll(&app, &grace.token, course).await;

        let (_, body) = send(
            &app,
            Method::POST,
            "/api/v1/progress",
            Some(&grace.token),
            Some(json!({ "lessonId": lesson, "completed": true })),
        )
        .await;
        let progress_id = body["data"]["id"].as_i64().unwrap();
        assert!(enrollment_completed(&app, &grace.token, course).await);

        let (status, _) = send(
            &app,
            Method::DELETE,
            &format!("/api/v1/progress/{}", progress_id),
            Some(&grace.token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!enrollment_completed(&app, &grace.token, course).await);
    }

    #[tokio::test]
    async fn completion_refresh_rolls_back_with_its_write() {
        let (app, state) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let lesson = create_lesson(&app, &ada.token, course, "Ownership").await;
        enroll(&app, &grace.token, course).await;

        {
            let mut transaction = state.db.begin().await.unwrap();
            sqlx::query(
                "INSERT INTO lesson_progress (student_id, lesson_id, progress_percent, completed) \
                 VALUES (?, ?, 100, 1)",
            )
            .bind(grace.id)
            .bind(lesson)
            .execute(&mut *transaction)
            .await
            .unwrap();
            refresh_completions(&mut transaction, course, Some(grace.id))
                .await
                .unwrap();
            transaction.rollback().await.unwrap();
        }

        let progress: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lesson_progress")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(progress, 0);
        assert!(!enrollment_completed(&app, &grace.token, course).await);
    }
}
