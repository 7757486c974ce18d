//! HTTP shim over the same method surface the WebSocket speaks.
//!
//! POST /rpc with a request frame body. Auth matches the upgrade rules;
//! streaming methods are rejected here. Error codes map to their HTTP
//! status equivalents.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use haya_protocol::frames::{RequestFrame, ResponseFrame};

use crate::app::AppState;
use crate::auth::{constant_time_token_eq, extract_credential, resolve_client_ip};

pub async fn rpc_shim_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<RequestFrame>,
) -> Response {
    let ip = resolve_client_ip(remote, &headers, &state.trusted_proxies);

    let decision = state.limiter.check(ip);
    if !decision.allowed {
        warn!(%ip, "rpc shim attempt while rate-locked");
        let retry_secs = (decision.retry_after_ms / 1000).max(1);
        return (
            StatusCode::UNAUTHORIZED,
            [("retry-after", retry_secs.to_string())],
            Json(ResponseFrame::err(&req.id, "UNAUTHORIZED", "rate limited")),
        )
            .into_response();
    }

    let presented = extract_credential(&headers, None, ip, state.tls_enabled());
    let authorized =
        presented.is_some_and(|token| constant_time_token_eq(&token, &state.token));
    if !authorized {
        state.limiter.record_failure(ip);
        return (
            StatusCode::UNAUTHORIZED,
            Json(ResponseFrame::err(&req.id, "UNAUTHORIZED", "unauthorized")),
        )
            .into_response();
    }
    state.limiter.record_success(ip);

    let res = crate::ws::dispatch::dispatch(&state, "http-shim", req, None).await;
    let status = match &res.error {
        Some(err) => match err.code.as_str() {
            "INVALID_REQUEST" => StatusCode::BAD_REQUEST,
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "RATE_LIMITED" | "BUDGET_EXCEEDED" => StatusCode::TOO_MANY_REQUESTS,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION" => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        None => StatusCode::OK,
    };
    (status, Json(res)).into_response()
}
