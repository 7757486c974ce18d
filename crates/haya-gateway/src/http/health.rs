use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health — liveness probe with provider breaker and channel state.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let providers: Vec<Value> = state
        .runtime
        .breaker()
        .snapshot()
        .into_iter()
        .map(|e| {
            json!({
                "name": e.name,
                "state": e.state,
                "consecutive_failures": e.consecutive_failures,
                "total_requests": e.total_requests,
                "total_failures": e.total_failures,
            })
        })
        .collect();

    let channels: Vec<Value> = state
        .dock
        .statuses()
        .into_iter()
        .map(|(id, status)| json!({ "id": id, "connected": status.connected }))
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "ws_clients": state.ws_clients.len(),
        "providers": providers,
        "channels": channels,
    }))
}
