//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the application: the health
//! check and the WebSocket endpoint browsers connect to.

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}
