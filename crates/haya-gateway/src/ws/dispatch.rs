//! Method routing for WS requests and the HTTP shim.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use haya_core::HayaError;
use haya_protocol::frames::{RequestFrame, ResponseFrame};
use haya_protocol::methods;

use crate::app::AppState;
use crate::ws::handlers;

/// Route one request to its handler. `out_tx` carries server-push events
/// for streaming methods; shim callers pass None and cannot stream.
pub async fn dispatch(
    state: &Arc<AppState>,
    conn_id: &str,
    req: RequestFrame,
    out_tx: Option<&mpsc::Sender<String>>,
) -> ResponseFrame {
    debug!(conn_id, method = %req.method, id = %req.id, "dispatching");
    let params = req.params.unwrap_or(serde_json::Value::Null);

    let result = match req.method.as_str() {
        methods::CHAT_SEND => handlers::chat_send(state, params).await,
        methods::CHAT_STREAM => match out_tx {
            Some(tx) => handlers::chat_stream(state, conn_id, &req.id, params, tx).await,
            None => Err(HayaError::Validation(
                "chat.stream requires a WebSocket connection".into(),
            )),
        },
        methods::CHAT_ABORT => handlers::chat_abort(state, conn_id, params).await,

        methods::SESSIONS_LIST => handlers::sessions_list(state).await,
        methods::SESSIONS_CREATE => handlers::sessions_create(state, params).await,
        methods::SESSIONS_DELETE => handlers::sessions_delete(state, params).await,
        methods::SESSIONS_HISTORY => handlers::sessions_history(state, params).await,

        methods::CHANNELS_LIST => handlers::channels_list(state).await,
        methods::CHANNELS_START => handlers::channels_start(state, params).await,
        methods::CHANNELS_STOP => handlers::channels_stop(state, params).await,

        methods::CRON_LIST => handlers::cron_list(state).await,
        methods::CRON_STATUS => handlers::cron_status(state).await,
        methods::CRON_ADD => handlers::cron_add(state, params).await,
        methods::CRON_REMOVE => handlers::cron_remove(state, params).await,

        other => Err(HayaError::NotFound(format!("method '{other}'"))),
    };

    match result {
        Ok(value) => ResponseFrame::ok(&req.id, value),
        Err(e) => ResponseFrame::from_error(&req.id, &e),
    }
}
