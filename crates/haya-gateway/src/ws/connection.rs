//! WebSocket connection lifecycle.
//!
//! Auth happens on the upgrade request (Bearer header or token query
//! parameter); a failed or rate-limited attempt still completes the
//! upgrade so the client receives a proper 1008 close with reason
//! "unauthorized". Authenticated connections run a select loop over
//! inbound frames, outbound responses/events, and the heartbeat tick.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, FromRequestParts, RawQuery, Request, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use haya_core::config::{HEARTBEAT_INTERVAL_SECS, MAX_PAYLOAD_BYTES};
use haya_protocol::frames::{EventFrame, RequestFrame, ResponseFrame};
use haya_protocol::methods::EVENT_TICK;

use crate::app::AppState;
use crate::auth::{constant_time_token_eq, extract_credential, resolve_client_ip};

/// Remembered request ids per connection, for duplicate detection.
const MAX_REMEMBERED_IDS: usize = 4096;
/// Queue of outbound frames per connection.
const OUTBOUND_QUEUE: usize = 256;

/// GET / — WebSocket upgrade when requested, otherwise a pointer to /chat.
pub async fn root_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    req: Request,
) -> Response {
    let wants_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !wants_upgrade {
        return axum::response::Html(
            "<!doctype html><title>Haya</title><p>Haya gateway. Chat UI at <a href=\"/chat\">/chat</a>.</p>",
        )
        .into_response();
    }

    let headers = req.headers().clone();
    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(u) => u,
        Err(rejection) => return rejection.into_response(),
    };

    let authorized = authorize_upgrade(&state, remote, &headers, query.as_deref());
    upgrade
        .on_upgrade(move |socket| handle_connection(socket, state, authorized))
        .into_response()
}

fn authorize_upgrade(
    state: &Arc<AppState>,
    remote: SocketAddr,
    headers: &HeaderMap,
    query: Option<&str>,
) -> bool {
    let ip = resolve_client_ip(remote, headers, &state.trusted_proxies);
    if !state.limiter.check(ip).allowed {
        warn!(%ip, "auth attempt while rate-locked");
        return false;
    }
    let presented = extract_credential(headers, query, ip, state.tls_enabled());
    match presented {
        Some(token) if constant_time_token_eq(&token, &state.token) => {
            state.limiter.record_success(ip);
            true
        }
        _ => {
            state.limiter.record_failure(ip);
            false
        }
    }
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>, authorized: bool) {
    let (mut tx, mut rx) = socket.split();

    if !authorized {
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "WS connection authenticated");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    state.ws_clients.insert(conn_id.clone(), out_tx.clone());

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_INTERVAL_SECS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tick.tick().await; // arm: the first tick fires immediately

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id = %conn_id, size = text.len(), "payload too large, closing");
                            break;
                        }
                        handle_frame(&state, &conn_id, &text, &mut seen_ids, &out_tx).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }

            out = out_rx.recv() => {
                match out {
                    Some(frame) => {
                        if tx.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = tick.tick() => {
                let frame = EventFrame::new(
                    EVENT_TICK,
                    serde_json::json!({ "ts": chrono::Utc::now().timestamp_millis() }),
                );
                if tx.send(Message::Text(frame.to_json().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // outstanding tool calls may finish; their results are discarded with
    // the dropped outbound channel
    for entry in state.active_streams.iter() {
        if entry.key().starts_with(&format!("{conn_id}/")) {
            entry.value().cancel();
        }
    }
    state.ws_clients.remove(&conn_id);
    info!(conn_id = %conn_id, "WS connection closed");
}

async fn handle_frame(
    state: &Arc<AppState>,
    conn_id: &str,
    text: &str,
    seen_ids: &mut HashSet<String>,
    out_tx: &mpsc::Sender<String>,
) {
    let req: RequestFrame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(_) => {
            // answer when an id can be recovered, drop otherwise
            if let Ok(partial) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(id) = partial.get("id").and_then(|v| v.as_str()) {
                    let res = ResponseFrame::err(id, "INVALID_REQUEST", "malformed request frame");
                    send_frame(out_tx, &res).await;
                    return;
                }
            }
            warn!(conn_id, "unparseable frame dropped");
            return;
        }
    };

    if !seen_ids.insert(req.id.clone()) {
        let res = ResponseFrame::err(&req.id, "INVALID_REQUEST", "duplicate request id");
        send_frame(out_tx, &res).await;
        return;
    }
    if seen_ids.len() > MAX_REMEMBERED_IDS {
        seen_ids.clear();
    }

    // dispatch off the read loop so a slow chat call never blocks pings
    let state = state.clone();
    let conn_id = conn_id.to_string();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let res = crate::ws::dispatch::dispatch(&state, &conn_id, req, Some(&out_tx)).await;
        send_frame(&out_tx, &res).await;
    });
}

async fn send_frame(out_tx: &mpsc::Sender<String>, res: &ResponseFrame) {
    let json = serde_json::to_string(res).unwrap_or_default();
    let _ = out_tx.send(json).await;
}
