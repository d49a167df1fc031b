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
use crate::api::common::utils::{finish_validation, required_text};
use crate::api::common::{ApiResponse, AppJson, PaginatedResponse};
use crate::api::v1::courses::fetch_visible_course;
use crate::api::v1::progress::refresh_completions;
use crate::api::v1::users::UserSummary;
use crate::errors::AppError;
use crate::InnerState;

const ROLE_MAX_LENGTH: usize = 50;
const DEFAULT_ROLE: &str = "student";

const ENROLLMENT_COLUMNS: &str = "e.id, e.student_id, u.username AS student_username, \
    e.course_id, c.title AS course_title, c.instructor_id, e.role, e.enrolled_at, e.completed, \
    e.completed_at, \
    (SELECT COUNT(*) FROM lessons l WHERE l.course_id = e.course_id) AS total_lessons, \
    (SELECT COUNT(*) FROM lesson_progress lp JOIN lessons l ON l.id = lp.lesson_id \
        WHERE l.course_id = e.course_id AND lp.student_id = e.student_id AND lp.completed = 1) \
        AS completed_lessons";
const ENROLLMENT_FROM: &str = "enrollments e \
    JOIN users u ON u.id = e.student_id \
    JOIN courses c ON c.id = e.course_id";

static ENROLLMENT_LIST: ListRules = ListRules {
    search_columns: &["c.title", "u.username"],
    ordering_fields: &[
        ("enrolledAt", "e.enrolled_at"),
        ("completedAt", "e.completed_at"),
        ("id", "e.id"),
    ],
    filters: &[
        FilterField {
            param: "course",
            column: "e.course_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "student",
            column: "e.student_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "completed",
            column: "e.completed",
            kind: FilterKind::Boolean,
        },
    ],
    default_ordering: "e.enrolled_at DESC, e.id DESC",
};

/// Own enrollments plus those in courses the caller teaches; staff see all.
fn enrollment_scope(user: &CurrentUser) -> Scope {
    if user.is_staff {
        Scope::Everything
    } else {
        Scope::Related {
            columns: &["e.student_id", "c.instructor_id"],
            user_id: user.id,
        }
    }
}

#[derive(Debug, FromRow)]
struct EnrollmentRow {
    id: i64,
    student_id: i64,
    student_username: String,
    course_id: i64,
    course_title: String,
    instructor_id: i64,
    role: String,
    enrolled_at: NaiveDateTime,
    completed: bool,
    completed_at: Option<NaiveDateTime>,
    total_lessons: i64,
    completed_lessons: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: i64,
    pub student: UserSummary,
    pub course: CourseSummary,
    #[serde(skip)]
    pub instructor_id: i64,
    pub role: String,
    pub enrolled_at: NaiveDateTime,
    pub completed: bool,
    pub completed_at: Option<NaiveDateTime>,
    pub total_lessons: i64,
    pub completed_lessons: i64,
    pub progress_percent: i64,
}

impl From<EnrollmentRow> for Enrollment {
    fn from(row: EnrollmentRow) -> Self {
        Enrollment {
            id: row.id,
            student: UserSummary {
                id: row.student_id,
                username: row.student_username,
            },
            course: CourseSummary {
                id: row.course_id,
                title: row.course_title,
            },
            instructor_id: row.instructor_id,
            role: row.role,
            enrolled_at: row.enrolled_at,
            completed: row.completed,
            completed_at: row.completed_at,
            total_lessons: row.total_lessons,
            completed_lessons: row.completed_lessons,
            progress_percent: progress_percent(row.completed_lessons, row.total_lessons),
        }
    }
}

fn progress_percent(completed: i64, total: i64) -> i64 {
    if total <= 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as i64
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEnrollmentRequest {
    pub course_id: i64,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchEnrollmentRequest {
    pub role: Option<String>,
}

fn validate_role(role: &str) -> Result<String, AppError> {
    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let role = required_text("role", role, ROLE_MAX_LENGTH, &mut errors);
    finish_validation(errors)?;
    Ok(role)
}

#[tracing::instrument(name = "Fetch enrollment", skip(db, user))]
async fn fetch_enrollment(
    db: &SqlitePool,
    enrollment_id: i64,
    user: &CurrentUser,
) -> Result<Enrollment, AppError> {
    fetch_scoped::<EnrollmentRow>(
        db,
        ENROLLMENT_COLUMNS,
        ENROLLMENT_FROM,
        "e.id",
        enrollment_id,
        &enrollment_scope(user),
    )
    .await?
    .map(Enrollment::from)
    .ok_or_else(|| AppError::NotFound("Enrollment not found".to_string()))
}

#[tracing::instrument(name = "List enrollments", skip(inner, params), fields(caller = user.id))]
pub async fn list_enrollments(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<Enrollment>>, AppError> {
    let query = ListQuery::parse(&params, &ENROLLMENT_LIST)?;
    let page = fetch_page::<EnrollmentRow>(
        &inner.db,
        inner.settings.db_timeout,
        ENROLLMENT_COLUMNS,
        ENROLLMENT_FROM,
        &enrollment_scope(&user),
        &query,
    )
    .await?;
    Ok(Json(page.map(Enrollment::from)))
}

#[tracing::instrument(name = "Get enrollment", skip(inner), fields(caller = user.id))]
pub async fn get_enrollment(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(enrollment_id): Path<i64>,
) -> Result<Json<ApiResponse<Enrollment>>, AppError> {
    let enrollment = fetch_enrollment(&inner.db, enrollment_id, &user).await?;
    Ok(Json(ApiResponse::success(enrollment)))
}

/// Enrolls the caller in a course visible to them.
#[tracing::instrument(name = "Create enrollment", skip(inner, payload), fields(student = user.id, course = payload.course_id))]
pub async fn create_enrollment(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CreateEnrollmentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Enrollment>>), AppError> {
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
    let role = validate_role(payload.role.as_deref().unwrap_or(DEFAULT_ROLE))?;

    let mut transaction = db.begin().await?;
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM enrollments WHERE student_id = ? AND course_id = ?)",
    )
    .bind(user.id)
    .bind(payload.course_id)
    .fetch_one(&mut *transaction)
    .await?;
    if exists {
        return Err(AppError::Conflict(
            "You are already enrolled in this course.".to_string(),
        ));
    }

    let enrollment_id: i64 = sqlx::query_scalar(
        "INSERT INTO enrollments (student_id, course_id, role) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(user.id)
    .bind(payload.course_id)
    .bind(&role)
    .fetch_one(&mut *transaction)
    .await?;

    // Progress recorded under an earlier enrollment still counts.
    refresh_completions(&mut transaction, payload.course_id, Some(user.id)).await?;
    transaction.commit().await?;

    tracing::info!("Created enrollment {}", enrollment_id);
    let enrollment = fetch_enrollment(&db, enrollment_id, &user).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(enrollment))))
}

#[tracing::instrument(name = "Update enrollment", skip(inner, payload), fields(caller = user.id))]
pub async fn update_enrollment(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(enrollment_id): Path<i64>,
    AppJson(payload): AppJson<PatchEnrollmentRequest>,
) -> Result<Json<ApiResponse<Enrollment>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_enrollment(&db, enrollment_id, &user).await?;
    user.ensure_owner(existing.instructor_id)?;

    let role = match payload.role {
        Some(role) => validate_role(&role)?,
        None => existing.role,
    };

    sqlx::query("UPDATE enrollments SET role = ? WHERE id = ?")
        .bind(&role)
        .bind(enrollment_id)
        .execute(&db)
        .await?;

    tracing::info!("Updated enrollment {}", enrollment_id);
    let enrollment = fetch_enrollment(&db, enrollment_id, &user).await?;
    Ok(Json(ApiResponse::success(enrollment)))
}

/// Students may leave; instructors may remove their students.
#[tracing::instrument(name = "Delete enrollment", skip(inner), fields(caller = user.id))]
pub async fn delete_enrollment(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(enrollment_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_enrollment(&inner.db, enrollment_id, &user).await?;
    if existing.student.id != user.id {
        user.ensure_owner(existing.instructor_id)?;
    }

    sqlx::query("DELETE FROM enrollments WHERE id = ?")
        .bind(enrollment_id)
        .execute(&inner.db)
        .await?;

    tracing::info!("Deleted enrollment {}", enrollment_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_course, enroll, register, register_staff, send, test_app};
    use axum::http::Method;
    use serde_json::json;

    #[test]
    fn percent_is_rounded_share_of_lessons() {
        assert_eq!(progress_percent(0, 0), 0);
        assert_eq!(progress_percent(1, 3), 33);
        assert_eq!(progress_percent(2, 3), 67);
        assert_eq!(progress_percent(4, 4), 100);
    }

    #[tokio::test]
    async fn enrollments_require_authentication() {
        let (app, _) = test_app().await;
        let (status, _) = send(&app, Method::GET, "/api/v1/enrollments", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_enrollment_conflicts() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/enrollments",
            Some(&grace.token),
            Some(json!({ "courseId": course })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["role"], "student");
        assert_eq!(body["data"]["student"]["username"], "grace");
        assert_eq!(body["data"]["progressPercent"], 0);

        let (status, _) = send(
            &app,
            Method::POST,
            "/api/v1/enrollments",
            Some(&grace.token),
            Some(json!({ "courseId": course })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn hidden_courses_cannot_be_joined() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let draft = create_course(&app, &ada.token, "Draft", false).await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/enrollments",
            Some(&grace.token),
            Some(json!({ "courseId": draft })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["errors"]["courseId"].is_array());
    }

    #[tokio::test]
    async fn listing_is_scoped_to_participants() {
        let (app, state) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let linus = register(&app, "linus").await;
        let admin = register_staff(&app, &state, "admin").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let other = create_course(&app, &linus.token, "Kernels", true).await;
        enroll(&app, &grace.token, course).await;
        enroll(&app, &grace.token, other).await;

        let (_, body) = send(&app, Method::GET, "/api/v1/enrollments", Some(&grace.token), None).await;
        assert_eq!(body["pagination"]["total"], 2);
        let (_, body) = send(&app, Method::GET, "/api/v1/enrollments", Some(&ada.token), None).await;
        assert_eq!(body["pagination"]["total"], 1);
        assert_eq!(body["data"][0]["course"]["title"], "Rust 101");
        let (_, body) = send(&app, Method::GET, "/api/v1/enrollments", Some(&admin.token), None).await;
        assert_eq!(body["pagination"]["total"], 2);
    }

    #[tokio::test]
    async fn instructor_manages_roles_and_students_may_leave() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        let enrollment = enroll(&app, &grace.token, course).await;
        let uri = format!("/api/v1/enrollments/{}", enrollment);

        let (status, _) = send(
            &app,
            Method::PATCH,
            &uri,
            Some(&grace.token),
            Some(json!({ "role": "assistant" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(
            &app,
            Method::PATCH,
            &uri,
            Some(&ada.token),
            Some(json!({ "role": "assistant" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["role"], "assistant");

        let (status, _) = send(&app, Method::DELETE, &uri, Some(&grace.token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn course_delete_cascades_to_enrollments() {
        let (app, _) = test_app().await;
        let ada = register(&app, "ada").await;
        let grace = register(&app, "grace").await;
        let course = create_course(&app, &ada.token, "Rust 101", true).await;
        enroll(&app, &grace.token, course).await;

        send(&app, Method::DELETE, &format!("/api/v1/courses/{}", course), Some(&ada.token), None).await;
        let (_, body) = send(&app, Method::GET, "/api/v1/enrollments", Some(&grace.token), None).await;
        assert_eq!(body["pagination"]["total"], 0);
    }
}
