use std::collections::HashMap;
use std::path::Path as FsPath;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::api::common::middleware::CurrentUser;
use crate::api::common::query::{
    fetch_page, fetch_scoped, FilterField, FilterKind, ListQuery, ListRules, Scope,
};
use crate::api::common::utils::{check_choice, finish_validation, required_text};
use crate::api::common::{deserialize_some, ApiResponse, AppJson, PaginatedResponse};
use crate::api::v1::users::UserSummary;
use crate::errors::AppError;
use crate::InnerState;

pub const COURSE_LEVELS: [&str; 3] = ["beginner", "intermediate", "advanced"];
pub const TITLE_MAX_LENGTH: usize = 200;
pub const AVATAR_MAX_BYTES: usize = 5 * 1024 * 1024;
const AVATAR_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];
const AVATAR_DIR: &str = "course_avatars";

const COURSE_COLUMNS: &str = "c.id, c.title, c.description, c.instructor_id, \
    u.username AS instructor_username, c.category_id, cat.name AS category_name, \
    cat.slug AS category_slug, c.level, c.avatar, c.is_published, c.created_at, c.updated_at, \
    (SELECT COUNT(*) FROM lessons l WHERE l.course_id = c.id) AS lesson_count, \
    (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id) AS enrollment_count, \
    (SELECT AVG(r.rating) FROM course_reviews r WHERE r.course_id = c.id) AS average_rating";
const COURSE_FROM: &str = "courses c \
    JOIN users u ON u.id = c.instructor_id \
    LEFT JOIN categories cat ON cat.id = c.category_id";

static COURSE_LIST: ListRules = ListRules {
    search_columns: &["c.title", "c.description", "u.username"],
    ordering_fields: &[
        ("title", "c.title"),
        ("createdAt", "c.created_at"),
        ("updatedAt", "c.updated_at"),
        ("rating", "average_rating"),
        ("enrollments", "enrollment_count"),
        ("id", "c.id"),
    ],
    filters: &[
        FilterField {
            param: "category",
            column: "c.category_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "instructor",
            column: "c.instructor_id",
            kind: FilterKind::Integer,
        },
        FilterField {
            param: "level",
            column: "c.level",
            kind: FilterKind::Text,
        },
        FilterField {
            param: "isPublished",
            column: "c.is_published",
            kind: FilterKind::Boolean,
        },
    ],
    default_ordering: "c.created_at DESC, c.id DESC",
};

/// Rows of any query joining `courses c` are limited to what `viewer` may see.
pub fn course_scope(viewer: Option<&CurrentUser>) -> Scope {
    match viewer {
        Some(user) if user.is_staff => Scope::Everything,
        _ => Scope::Published {
            flag: "c.is_published",
            owners: &["c.instructor_id"],
            viewer: viewer.map(|user| user.id),
        },
    }
}

#[derive(Debug, FromRow)]
struct CourseRow {
    id: i64,
    title: String,
    description: String,
    instructor_id: i64,
    instructor_username: String,
    category_id: Option<i64>,
    category_name: Option<String>,
    category_slug: Option<String>,
    level: String,
    avatar: Option<String>,
    is_published: bool,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
    lesson_count: i64,
    enrollment_count: i64,
    average_rating: Option<f64>,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CategorySummary {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub instructor: UserSummary,
    pub category: Option<CategorySummary>,
    pub level: String,
    pub avatar: Option<String>,
    pub is_published: bool,
    pub lesson_count: i64,
    pub enrollment_count: i64,
    pub average_rating: Option<f64>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<CourseRow> for Course {
    fn from(row: CourseRow) -> Self {
        let category = match (row.category_id, row.category_name, row.category_slug) {
            (Some(id), Some(name), Some(slug)) => Some(CategorySummary { id, name, slug }),
            _ => None,
        };
        Course {
            id: row.id,
            title: row.title,
            description: row.description,
            instructor: UserSummary {
                id: row.instructor_id,
                username: row.instructor_username,
            },
            category,
            level: row.level,
            avatar: row.avatar,
            is_published: row.is_published,
            lesson_count: row.lesson_count,
            enrollment_count: row.enrollment_count,
            average_rating: row.average_rating.map(|r| (r * 100.0).round() / 100.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCourseRequest {
    pub title: String,
    pub description: Option<String>,
    pub category_id: Option<i64>,
    pub level: Option<String>,
    pub is_published: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchCourseRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default, deserialize_with = "deserialize_some")]
    pub category_id: Option<Option<i64>>,
    pub level: Option<String>,
    pub is_published: Option<bool>,
}

#[derive(TryFromMultipart)]
pub struct AvatarUpload {
    #[form_data(limit = "5MiB")]
    pub avatar: FieldData<Bytes>,
}

/// Fetches a course the viewer may see; hidden courses are reported as missing.
#[tracing::instrument(name = "Fetch visible course", skip(db, viewer))]
pub async fn fetch_visible_course(
    db: &SqlitePool,
    course_id: i64,
    viewer: Option<&CurrentUser>,
) -> Result<Course, AppError> {
    fetch_scoped::<CourseRow>(
        db,
        COURSE_COLUMNS,
        COURSE_FROM,
        "c.id",
        course_id,
        &course_scope(viewer),
    )
    .await?
    .map(Course::from)
    .ok_or_else(|| AppError::NotFound("Course not found".to_string()))
}

async fn check_category(
    db: &SqlitePool,
    category_id: Option<i64>,
    errors: &mut HashMap<String, Vec<String>>,
) -> Result<(), AppError> {
    let Some(category_id) = category_id else {
        return Ok(());
    };
    let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM categories WHERE id = ?)")
        .bind(category_id)
        .fetch_one(db)
        .await?;
    if !exists {
        errors.entry("categoryId".to_string()).or_default().push(format!(
            "Invalid pk \"{}\" - object does not exist.",
            category_id
        ));
    }
    Ok(())
}

#[tracing::instrument(name = "List courses", skip(inner, params, viewer))]
pub async fn list_courses(
    viewer: Option<CurrentUser>,
    State(inner): State<InnerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<PaginatedResponse<Course>>, AppError> {
    let query = ListQuery::parse(&params, &COURSE_LIST)?;
    let page = fetch_page::<CourseRow>(
        &inner.db,
        inner.settings.db_timeout,
        COURSE_COLUMNS,
        COURSE_FROM,
        &course_scope(viewer.as_ref()),
        &query,
    )
    .await?;
    Ok(Json(page.map(Course::from)))
}

#[tracing::instrument(name = "Get course", skip(inner, viewer))]
pub async fn get_course(
    viewer: Option<CurrentUser>,
    State(inner): State<InnerState>,
    Path(course_id): Path<i64>,
) -> Result<Json<ApiResponse<Course>>, AppError> {
    let course = fetch_visible_course(&inner.db, course_id, viewer.as_ref()).await?;
    Ok(Json(ApiResponse::success(course)))
}

#[tracing::instrument(name = "Create course", skip(inner, payload), fields(instructor = user.id))]
pub async fn create_course(
    user: CurrentUser,
    State(inner): State<InnerState>,
    AppJson(payload): AppJson<CreateCourseRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Course>>), AppError> {
    let InnerState { db, .. } = inner;

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let title = required_text("title", &payload.title, TITLE_MAX_LENGTH, &mut errors);
    let level = payload.level.unwrap_or_else(|| "beginner".to_string());
    check_choice("level", &level, &COURSE_LEVELS, &mut errors);
    check_category(&db, payload.category_id, &mut errors).await?;
    finish_validation(errors)?;

    let course_id: i64 = sqlx::query_scalar(
        r#"INSERT INTO courses (title, description, instructor_id, category_id, level, is_published)
           VALUES (?, ?, ?, ?, ?, ?)
           RETURNING id"#,
    )
    .bind(&title)
    .bind(payload.description.unwrap_or_default())
    .bind(user.id)
    .bind(payload.category_id)
    .bind(&level)
    .bind(payload.is_published.unwrap_or(false))
    .fetch_one(&db)
    .await?;

    tracing::info!("Created course {}", course_id);
    let course = fetch_visible_course(&db, course_id, Some(&user)).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(course))))
}

#[tracing::instrument(name = "Update course", skip(inner, payload), fields(caller = user.id))]
pub async fn update_course(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(course_id): Path<i64>,
    AppJson(payload): AppJson<PatchCourseRequest>,
) -> Result<Json<ApiResponse<Course>>, AppError> {
    let InnerState { db, .. } = inner;

    let existing = fetch_visible_course(&db, course_id, Some(&user)).await?;
    user.ensure_owner(existing.instructor.id)?;

    let mut errors: HashMap<String, Vec<String>> = HashMap::new();
    let title = match payload.title {
        Some(title) => required_text("title", &title, TITLE_MAX_LENGTH, &mut errors),
        None => existing.title,
    };
    let level = payload.level.unwrap_or(existing.level);
    check_choice("level", &level, &COURSE_LEVELS, &mut errors);
    let category_id = match payload.category_id {
        Some(category_id) => {
            check_category(&db, category_id, &mut errors).await?;
            category_id
        }
        None => existing.category.map(|category| category.id),
    };
    finish_validation(errors)?;

    sqlx::query(
        r#"UPDATE courses
           SET title = ?, description = ?, category_id = ?, level = ?, is_published = ?,
               updated_at = CURRENT_TIMESTAMP
           WHERE id = ?"#,
    )
    .bind(&title)
    .bind(payload.description.unwrap_or(existing.description))
    .bind(category_id)
    .bind(&level)
    .bind(payload.is_published.unwrap_or(existing.is_published))
    .bind(course_id)
    .execute(&db)
    .await?;

    tracing::info!("Updated course {}", course_id);
    let course = fetch_visible_course(&db, course_id, Some(&user)).await?;
    Ok(Json(ApiResponse::success(course)))
}

/// Lessons, enrollments, progress and reviews go with the course.
#[tracing::instrument(name = "Delete course", skip(inner), fields(caller = user.id))]
pub async fn delete_course(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(course_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let existing = fetch_visible_course(&inner.db, course_id, Some(&user)).await?;
    user.ensure_owner(existing.instructor.id)?;

    sqlx::query("DELETE FROM courses WHERE id = ?")
        .bind(course_id)
        .execute(&inner.db)
        .await?;

    if let Some(avatar) = existing.avatar.as_deref() {
        remove_stored_avatar(&inner.settings.media_root, avatar).await;
    }

    tracing::info!("Deleted course {}", course_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Lowercased extension of `file_name` when it is an accepted image type.
fn avatar_extension(file_name: Option<&str>) -> Option<String> {
    let extension = FsPath::new(file_name?)
        .extension()?
        .to_str()?
        .to_lowercase();
    AVATAR_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

async fn remove_stored_avatar(media_root: &FsPath, public_path: &str) {
    let Some(relative) = public_path.strip_prefix("/media/") else {
        return;
    };
    if relative.contains("..") {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(media_root.join(relative)).await {
        tracing::warn!("Could not remove old avatar {}: {}", public_path, e);
    }
}

#[tracing::instrument(name = "Upload course avatar", skip(inner, upload), fields(caller = user.id))]
pub async fn upload_avatar(
    user: CurrentUser,
    State(inner): State<InnerState>,
    Path(course_id): Path<i64>,
    TypedMultipart(upload): TypedMultipart<AvatarUpload>,
) -> Result<Json<ApiResponse<Course>>, AppError> {
    let InnerState { db, settings } = inner;

    let existing = fetch_visible_course(&db, course_id, Some(&user)).await?;
    user.ensure_owner(existing.instructor.id)?;

    let extension = avatar_extension(upload.avatar.metadata.file_name.as_deref()).ok_or_else(|| {
        AppError::field(
            "avatar",
            format!(
                "Upload a valid image. Allowed extensions are: {}.",
                AVATAR_EXTENSIONS.join(", ")
            ),
        )
    })?;
    if upload.avatar.contents.is_empty() {
        return Err(AppError::field("avatar", "The submitted file is empty."));
    }
    if upload.avatar.contents.len() > AVATAR_MAX_BYTES {
        return Err(AppError::field("avatar", "The submitted file is too large."));
    }

    let directory = settings.media_root.join(AVATAR_DIR);
    tokio::fs::create_dir_all(&directory).await.map_err(|e| {
        AppError::Unexpected(anyhow::Error::new(e).context("Failed to create media directory"))
    })?;

    let file_name = format!("{}_{}.{}", course_id, uuid::Uuid::new_v4().simple(), extension);
    tokio::fs::write(directory.join(&file_name), &upload.avatar.contents)
        .await
        .map_err(|e| {
            AppError::Unexpected(anyhow::Error::new(e).context("Failed to store avatar"))
        })?;

    let public_path = format!("/media/{}/{}", AVATAR_DIR, file_name);
    sqlx::query("UPDATE courses SET avatar = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(&public_path)
        .bind(course_id)
        .execute(&db)
        .await?;

    if let Some(previous) = existing.avatar.as_deref() {
        remove_stored_avatar(&settings.media_root, previous).await;
    }

    tracing::info!("Stored avatar {} for course {}", public_path, course_id);
    let course = fetch_visible_course(&db, course_id, Some(&user)).await?;
    Ok(Json(ApiResponse::success(course)))
}
