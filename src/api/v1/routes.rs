//! V1 API route definitions

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};

use crate::api::common::middleware::auth_middleware;
use crate::api::v1::auth::{login, logout, me, register};
use crate::api::v1::categories::{
    create_category, delete_category, get_category, list_categories, update_category,
};
use crate::api::v1::courses::{
    create_course, delete_course, get_course, list_courses, update_course, upload_avatar,
    AVATAR_MAX_BYTES,
};
use crate::api::v1::enrollments::{
    create_enrollment, delete_enrollment, get_enrollment, list_enrollments, update_enrollment,
};
use crate::api::v1::lessons::{
    create_lesson, delete_lesson, get_lesson, list_lessons, update_lesson,
};
use crate::api::v1::profiles::{
    create_profile, delete_profile, get_profile, list_profiles, update_profile,
};
use crate::api::v1::progress::{
    create_progress, delete_progress, get_progress, list_progress, update_progress,
};
use crate::api::v1::reviews::{
    create_review, delete_review, get_review, list_reviews, update_review,
};
use crate::api::v1::users::{delete_user, get_user, list_users, update_user};
use crate::authentication::change_password;
use crate::InnerState;

/// Creates V1 API routes.
///
/// Registration, login and logout are open; everything else sits behind
/// `auth_middleware`, which lets anonymous reads through.
#[tracing::instrument(name = "create_v1_routes", skip(state))]
pub fn create_v1_routes(state: InnerState) -> Router<InnerState> {
    tracing::info!("Setting up V1 API routes");

    let public = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout));

    let gated = Router::new()
        // Account
        .route("/auth/me", get(me))
        .route("/auth/password", put(change_password))
        // Users and profiles
        .route("/users", get(list_users))
        .route(
            "/users/:id",
            get(get_user)
                .put(update_user)
                .patch(update_user)
                .delete(delete_user),
        )
        .route("/profiles", get(list_profiles).post(create_profile))
        .route(
            "/profiles/:id",
            get(get_profile)
                .put(update_profile)
                .patch(update_profile)
                .delete(delete_profile),
        )
        // Catalogue
        .route("/categories", get(list_categories).post(create_category))
        .route(
            "/categories/:id",
            get(get_category)
                .put(update_category)
                .patch(update_category)
                .delete(delete_category),
        )
        .route("/courses", get(list_courses).post(create_course))
        .route(
            "/courses/:id",
            get(get_course)
                .put(update_course)
                .patch(update_course)
                .delete(delete_course),
        )
        .route(
            "/courses/:id/avatar",
            post(upload_avatar).layer(DefaultBodyLimit::max(AVATAR_MAX_BYTES + 64 * 1024)),
        )
        .route("/lessons", get(list_lessons).post(create_lesson))
        .route(
            "/lessons/:id",
            get(get_lesson)
                .put(update_lesson)
                .patch(update_lesson)
                .delete(delete_lesson),
        )
        // Learning
        .route("/enrollments", get(list_enrollments).post(create_enrollment))
        .route(
            "/enrollments/:id",
            get(get_enrollment)
                .put(update_enrollment)
                .patch(update_enrollment)
                .delete(delete_enrollment),
        )
        .route("/progress", get(list_progress).post(create_progress))
        .route(
            "/progress/:id",
            get(get_progress)
                .put(update_progress)
                .patch(update_progress)
                .delete(delete_progress),
        )
        .route("/reviews", get(list_reviews).post(create_review))
        .route(
            "/reviews/:id",
            get(get_review)
                .put(update_review)
                .patch(update_review)
                .delete(delete_review),
        )
        .route_layer(middleware::from_fn_with_state(state, auth_middleware));

    public.merge(gated)
}
