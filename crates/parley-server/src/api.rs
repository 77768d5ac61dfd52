//! HTTP discovery API.
//!
//! Served on the main port next to (or instead of) the WebSocket endpoint.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::Realm;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Shared state of the API handlers.
pub struct ApiState {
    realm: Arc<Realm>,
    key: String,
    allow_discovery: bool,
}

impl ApiState {
    #[must_use]
    pub fn new(realm: Arc<Realm>, key: impl Into<String>, allow_discovery: bool) -> Self {
        Self {
            realm,
            key: key.into(),
            allow_discovery,
        }
    }

    fn authorize(&self, key: &str) -> Result<(), ApiError> {
        if key == self.key {
            Ok(())
        } else {
            Err(ApiError::InvalidKey)
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid key")]
    InvalidKey,

    #[error("Peer discovery is disabled")]
    DiscoveryDisabled,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(error = %self, "API request refused");
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}

/// Build the discovery routes.
pub fn routes(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/:key/id", get(id_handler))
        .route("/:key/peers", get(peers_handler))
        .with_state(state)
}

async fn index_handler() -> impl IntoResponse {
    Json(json!({
        "name": "parley",
        "description": "Peer signaling and relay server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.realm.count()
    }))
}

/// Hand out a fresh random id.
async fn id_handler(
    Path(key): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<String, ApiError> {
    state.authorize(&key)?;
    Ok(uuid::Uuid::new_v4().to_string())
}

async fn peers_handler(
    Path(key): Path<String>,
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<String>>, ApiError> {
    state.authorize(&key)?;
    if !state.allow_discovery {
        return Err(ApiError::DiscoveryDisabled);
    }
    Ok(Json(state.realm.all_ids()))
}
