//! HTTP surface of the service
//!
//! Versioned endpoints live under `api/v1`; `create_app` assembles them with
//! the system routes, the media directory and the shared layers.

pub mod common;
pub mod v1;

use axum::Router;
use tower_cookies::CookieManagerLayer;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::api::common::tracing::{
    make_custom_span, on_custom_failure, on_custom_request, on_custom_response,
};
use crate::system::create_system_router;
use crate::InnerState;

/// Builds the application router without the metrics layer.
#[tracing::instrument(name = "create_app", skip(state))]
pub fn create_app(state: InnerState) -> Router {
    tracing::info!("Creating application router");

    let media = ServeDir::new(&state.settings.media_root);

    Router::new()
        .merge(create_system_router())
        .nest("/api/v1", v1::routes::create_v1_routes(state.clone()))
        .nest_service("/media", media)
        .layer(CookieManagerLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(make_custom_span::<axum::body::Body>)
                .on_request(on_custom_request::<axum::body::Body>)
                .on_response(on_custom_response::<axum::body::Body>)
                .on_failure(on_custom_failure),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
