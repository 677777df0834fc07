use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::json;

use crate::dataserver::{DataServer, NodeSummary};

pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn info_handler(State(data): State<Arc<DataServer>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": "keystone-metaserver",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": keystone_protocol::PROTOCOL_VERSION,
        "apps": data.apps(),
        "nodes": data.node_count(),
    }))
}

/// Connected nodes with their held-lock counts.
pub async fn nodes_handler(State(data): State<Arc<DataServer>>) -> Json<Vec<NodeSummary>> {
    Json(data.nodes())
}
