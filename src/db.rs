//! Database setup: connection pool and schema.

use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::Settings;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT NOT NULL,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        is_staff INTEGER NOT NULL DEFAULT 0,
        last_login TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL UNIQUE REFERENCES users(id) ON DELETE CASCADE,
        role TEXT NOT NULL DEFAULT 'student' CHECK (role IN ('student', 'instructor')),
        bio TEXT NOT NULL DEFAULT '',
        avatar_url TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS categories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        slug TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS courses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL CHECK (length(title) <= 200),
        description TEXT NOT NULL DEFAULT '',
        instructor_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        category_id INTEGER REFERENCES categories(id) ON DELETE SET NULL,
        level TEXT NOT NULL DEFAULT 'beginner'
            CHECK (level IN ('beginner', 'intermediate', 'advanced')),
        avatar TEXT,
        is_published INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lessons (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        course_id INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
        title TEXT NOT NULL CHECK (length(title) <= 200),
        content TEXT NOT NULL DEFAULT '',
        video_url TEXT,
        position INTEGER NOT NULL DEFAULT 0,
        duration_minutes INTEGER NOT NULL DEFAULT 0 CHECK (duration_minutes >= 0),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enrollments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        course_id INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
        role TEXT NOT NULL DEFAULT 'student' CHECK (length(role) <= 50),
        enrolled_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        completed INTEGER NOT NULL DEFAULT 0,
        completed_at TEXT,
        UNIQUE (student_id, course_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lesson_progress (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        lesson_id INTEGER NOT NULL REFERENCES lessons(id) ON DELETE CASCADE,
        progress_percent INTEGER NOT NULL DEFAULT 0
            CHECK (progress_percent BETWEEN 0 AND 100),
        completed INTEGER NOT NULL DEFAULT 0,
        completed_at TEXT,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (student_id, lesson_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS course_reviews (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        student_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        course_id INTEGER NOT NULL REFERENCES courses(id) ON DELETE CASCADE,
        rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
        comment TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (student_id, course_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_courses_instructor ON courses(instructor_id)",
    "CREATE INDEX IF NOT EXISTS idx_courses_category ON courses(category_id)",
    "CREATE INDEX IF NOT EXISTS idx_lessons_course ON lessons(course_id, position)",
    "CREATE INDEX IF NOT EXISTS idx_enrollments_course ON enrollments(course_id)",
    "CREATE INDEX IF NOT EXISTS idx_lesson_progress_lesson ON lesson_progress(lesson_id)",
    "CREATE INDEX IF NOT EXISTS idx_course_reviews_course ON course_reviews(course_id)",
];

/// Opens the pool described by `DATABASE_URL` and makes sure the schema exists.
#[tracing::instrument(name = "Initialize database", skip(settings))]
pub async fn init_db(settings: &Settings) -> Result<SqlitePool> {
    tracing::info!("Connecting to database");

    let options = SqliteConnectOptions::from_str(&settings.database_url)
        .with_context(|| format!("Invalid DATABASE_URL: {}", settings.database_url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    create_schema(&pool).await?;

    if let Some(email) = settings.admin_email.as_deref() {
        if promote_admin(&pool, email).await? {
            tracing::info!("Granted staff rights to {}", email);
        } else {
            tracing::info!("{} will be granted staff rights on registration", email);
        }
    }

    tracing::info!("Database ready");
    Ok(pool)
}

/// Marks the user registered under `email` as staff. Returns whether one exists.
pub async fn promote_admin(pool: &SqlitePool, email: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE users SET is_staff = 1 WHERE email = ? COLLATE NOCASE")
        .bind(email)
        .execute(pool)
        .await
        .context("Failed to promote admin account")?;
    Ok(result.rows_affected() > 0)
}

/// In-memory database with the full schema. A single connection keeps the
/// memory database alive for the whole test.
#[cfg(test)]
pub async fn setup_test_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to create database schema")?;
    }
    tracing::debug!("Schema verified ({} statements)", SCHEMA.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_creation_is_idempotent() {
        let pool = setup_test_database().await.unwrap();
        create_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        assert_eq!(
            tables,
            vec![
                "categories",
                "course_reviews",
                "courses",
                "enrollments",
                "lesson_progress",
                "lessons",
                "profiles",
                "users"
            ]
        );
    }

    #[tokio::test]
    async fn admin_email_is_promoted_to_staff() {
        let pool = setup_test_database().await.unwrap();
        sqlx::query("INSERT INTO users (username, email, password_hash) VALUES ('root', 'root@x.io', 'h')")
            .execute(&pool)
            .await
            .unwrap();

        assert!(promote_admin(&pool, "ROOT@x.io").await.unwrap());
        assert!(!promote_admin(&pool, "nobody@x.io").await.unwrap());

        let is_staff: bool = sqlx::query_scalar("SELECT is_staff FROM users WHERE username = 'root'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(is_staff);
    }

    #[tokio::test]
    async fn review_rating_is_bounded() {
        let pool = setup_test_database().await.unwrap();
        sqlx::query("INSERT INTO users (username, email, password_hash) VALUES ('a', 'a@x.io', 'h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO courses (title, instructor_id) VALUES ('c', 1)")
            .execute(&pool)
            .await
            .unwrap();

        let err = sqlx::query(
            "INSERT INTO course_reviews (student_id, course_id, rating) VALUES (1, 1, 6)",
        )
        .execute(&pool)
        .await
        .unwrap_err();

        assert!(matches!(err, sqlx::Error::Database(ref e) if e.is_check_violation()));
    }

    #[tokio::test]
    async fn deleting_a_course_cascades() {
        let pool = setup_test_database().await.unwrap();
        sqlx::query("INSERT INTO users (username, email, password_hash) VALUES ('a', 'a@x.io', 'h')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO courses (title, instructor_id) VALUES ('c', 1)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO lessons (course_id, title) VALUES (1, 'l')")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO enrollments (student_id, course_id) VALUES (1, 1)")
            .execute(&pool)
            .await
            .unwrap();

        sqlx::query("DELETE FROM courses WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let lessons: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lessons")
            .fetch_one(&pool)
            .await
            .unwrap();
        let enrollments: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enrollments")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!((lessons, enrollments), (0, 0));
    }
}
