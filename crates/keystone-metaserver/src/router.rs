use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::dataserver::DataServer;
use crate::handler;

/// Build the admin router.
pub fn build_router(data: Arc<DataServer>) -> Router {
    Router::new()
        .route("/v1/health", get(handler::health_handler))
        .route("/v1/info", get(handler::info_handler))
        .route("/v1/nodes", get(handler::nodes_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(data)
}
