mod api;
mod authentication;
mod config;
mod db;
mod errors;
mod system;
#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use sqlx::SqlitePool;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::api::create_app;
use crate::config::Settings;
use crate::db::init_db;

#[derive(Clone)]
pub struct InnerState {
    pub db: SqlitePool,
    pub settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api_lms=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Arc::new(Settings::from_env()?);
    let db = init_db(&settings).await?;

    tokio::fs::create_dir_all(&settings.media_root)
        .await
        .with_context(|| format!("Could not create {}", settings.media_root.display()))?;

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let address = settings.address();
    let app_state = InnerState { db, settings };

    let app = create_app(app_state)
        .route("/metrics", get(|| async move { metric_handle.render() }))
        .layer(prometheus_layer);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Could not bind {}", address))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
