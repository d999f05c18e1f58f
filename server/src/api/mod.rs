//! The thin HTTP/WebSocket query and notification surface (§2, §6): list
//! devices, list flows with filters, top-N `buckets_minute` aggregations,
//! list/dismiss threats, capture health, and a notification websocket. No
//! dashboard, auth, or session machinery — this is a narrow interface
//! consumed by a presentation layer external to this crate.

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::AppConfig;
use crate::pipeline::PipelineHandles;
use crate::ws::hub::WsHub;

pub mod analytics;
pub mod devices;
pub mod error;
pub mod flows;
pub mod health;
pub mod notifications;
pub mod threats;

pub use error::AppError;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: AppConfig,
    pub ws_hub: Arc<WsHub>,
    /// `None` when the HTTP surface is exercised without a live capture
    /// pipeline (e.g. tests driving the query surface directly against a
    /// seeded database).
    pub pipeline: Option<PipelineHandles>,
}

impl AppState {
    pub fn new(db: SqlitePool, config: AppConfig, ws_hub: Arc<WsHub>, pipeline: Option<PipelineHandles>) -> Self {
        Self { db, config, ws_hub, pipeline }
    }
}

/// Build the `/api/v1` router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    let routes = Router::new()
        .route("/devices", get(devices::list))
        .route("/flows", get(flows::list))
        .route("/top", get(analytics::top))
        .route("/threats", get(threats::list))
        .route("/threats/:id/dismiss", post(threats::dismiss))
        .route("/health", get(health::health))
        .route("/ws", get(notifications::ws_handler));

    Router::new()
        .nest("/api/v1", routes)
        .layer(cors)
        .with_state(state)
}
