//! Helpers for driving the router in tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::api::create_app;
use crate::config::Settings;
use crate::db::setup_test_database;
use crate::InnerState;

pub const PASSWORD: &str = "correct horse battery";

pub struct TestUser {
    pub id: i64,
    pub token: String,
}

pub async fn test_state() -> InnerState {
    InnerState {
        db: setup_test_database().await.unwrap(),
        settings: Arc::new(Settings::for_tests()),
    }
}

pub async fn test_app() -> (Router, InnerState) {
    let state = test_state().await;
    (create_app(state.clone()), state)
}

/// Sends a JSON request and returns the status with the decoded body
/// (`Null` when the body is empty).
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn login(app: &Router, email: &str) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/v1/auth/login",
        None,
        Some(json!({ "email": email, "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body["data"]["token"].as_str().unwrap().to_string()
}

/// Registers `<username>@example.com` and logs in.
pub async fn register(app: &Router, username: &str) -> TestUser {
    let email = format!("{}@example.com", username);
    let (status, body) = send(
        app,
        Method::POST,
        "/api/v1/auth/register",
        None,
        Some(json!({ "username": username, "email": email, "password": PASSWORD })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "registration failed: {body}");

    TestUser {
        id: body["data"]["id"].as_i64().unwrap(),
        token: login(app, &email).await,
    }
}

/// Registers a user, flags it as staff and logs in again so the token carries the role.
pub async fn register_staff(app: &Router, state: &InnerState, username: &str) -> TestUser {
    let user = register(app, username).await;
    sqlx::query("UPDATE users SET is_staff = 1 WHERE id = ?")
        .bind(user.id)
        .execute(&state.db)
        .await
        .unwrap();
    TestUser {
        id: user.id,
        token: login(app, &format!("{}@example.com", username)).await,
    }
}

pub async fn create_course(app: &Router, token: &str, title: &str, published: bool) -> i64 {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/v1/courses",
        Some(token),
        Some(json!({ "title": title, "isPublished": published })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "course creation failed: {body}");
    body["data"]["id"].as_i64().unwrap()
}

pub async fn create_lesson(app: &Router, token: &str, course: i64, title: &str) -> i64 {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/v1/lessons",
        Some(token),
        Some(json!({ "courseId": course, "title": title })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "lesson creation failed: {body}");
    body["data"]["id"].as_i64().unwrap()
}

pub async fn enroll(app: &Router, token: &str, course: i64) -> i64 {
    let (status, body) = send(
        app,
        Method::POST,
        "/api/v1/enrollments",
        Some(token),
        Some(json!({ "courseId": course })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "enrollment failed: {body}");
    body["data"]["id"].as_i64().unwrap()
}
