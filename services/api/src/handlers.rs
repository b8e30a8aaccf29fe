//! Axum Handlers for the HTTP surface
//!
//! Everything interesting happens over the WebSocket; the plain HTTP routes
//! only report liveness.

use axum::response::Json;
use serde_json::{Value, json};

/// Liveness check for load balancers and container orchestration.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let Json(body) = health().await;
        assert_eq!(body, json!({ "status": "healthy" }));
    }
}
