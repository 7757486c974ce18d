//! RPC method handlers. Each returns the `result` payload or a taxonomy
//! error that dispatch folds into the response frame.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use haya_agent::pipeline::{HistoryOptions, Summarizer};
use haya_agent::runtime::ChatParams;
use haya_agent::stream::StreamEvent;
use haya_channels::types::META_SESSION_KEY;
use haya_channels::InboundMessage;
use haya_core::wrap::wrap_external;
use haya_core::{HayaError, Message, Result};
use haya_protocol::frames::EventFrame;
use haya_protocol::methods;
use haya_sessions::{SessionMeta, UsageRecord};

use crate::app::AppState;

fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| HayaError::Validation(e.to_string()))
}

// --- chat -------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSendParams {
    session_id: String,
    message: String,
    model: Option<String>,
}

pub async fn chat_send(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: ChatSendParams = parse_params(params)?;

    let mut metadata = BTreeMap::new();
    metadata.insert(META_SESSION_KEY.to_string(), json!(p.session_id));
    let inbound = InboundMessage {
        channel: "webchat".to_string(),
        channel_id: p.session_id.clone(),
        sender_id: "webchat".to_string(),
        sender_name: None,
        content: p.message,
        thread_id: None,
        timestamp: chrono::Utc::now().timestamp_millis(),
        metadata,
    };

    match state.processor.process(inbound).await? {
        Some(text) => Ok(json!({ "sessionId": p.session_id, "text": text })),
        None => Err(HayaError::Internal("message was dropped".into())),
    }
}

pub async fn chat_stream(
    state: &Arc<AppState>,
    conn_id: &str,
    req_id: &str,
    params: Value,
    out_tx: &mpsc::Sender<String>,
) -> Result<Value> {
    let p: ChatSendParams = parse_params(params)?;
    let session_id = p.session_id.clone();

    let wrapped = wrap_external("webchat", &p.message);
    let mut user_msg = Message::user(wrapped.content);
    user_msg.warnings = wrapped.warnings;

    // same critical section as the channel pipeline
    let lock = state.history.session_lock(&session_id);
    let _guard = lock.lock().await;

    let history = load_history(state, &session_id).await?;

    // forward stream events to this connection only
    let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(64);
    let forward_out = out_tx.clone();
    let forward_req = req_id.to_string();
    let forwarder = tokio::spawn(async move {
        while let Some(ev) = ev_rx.recv().await {
            let frame = match ev {
                StreamEvent::Delta { content } => EventFrame::new(
                    methods::EVENT_CHAT_DELTA,
                    json!({ "id": forward_req, "content": content }),
                ),
                StreamEvent::ToolCallStart { id, name } => EventFrame::new(
                    methods::EVENT_CHAT_TOOL_CALL,
                    json!({ "id": forward_req, "toolCallId": id, "name": name }),
                ),
                StreamEvent::ToolResult { id, excerpt } => EventFrame::new(
                    methods::EVENT_CHAT_TOOL_RESULT,
                    json!({ "id": forward_req, "toolCallId": id, "excerpt": excerpt }),
                ),
                StreamEvent::Error { message } => EventFrame::new(
                    methods::EVENT_CHAT_RESPONSE,
                    json!({ "id": forward_req, "error": message }),
                ),
            };
            if forward_out.send(frame.to_json()).await.is_err() {
                break;
            }
        }
    });

    let stream_key = format!("{conn_id}/{req_id}");
    let abort = CancellationToken::new();
    state.active_streams.insert(stream_key.clone(), abort.clone());

    let chat = state.runtime.chat_stream(
        ChatParams {
            session_id: session_id.clone(),
            message: user_msg.clone(),
            model: p.model,
            extra_tools: Vec::new(),
        },
        history,
        ev_tx,
    );

    let outcome = tokio::select! {
        result = chat => {
            state.active_streams.remove(&stream_key);
            result.map_err(|e| e.into_haya())?
        }
        _ = abort.cancelled() => {
            state.active_streams.remove(&stream_key);
            forwarder.abort();
            return Err(HayaError::Internal("chat aborted".into()));
        }
    };
    let _ = forwarder.await;

    if let Some(usage) = outcome.usage {
        let record = UsageRecord {
            session_id: session_id.clone(),
            model: state.runtime.default_model().to_string(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_usd: 0.0,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = state.usage.record(&record) {
            warn!(error = %e, "usage record failed");
        }
    }

    state.history.add_message(&session_id, &user_msg)?;
    state.history.add_messages(&session_id, &outcome.transcript)?;

    let text = outcome.message.content.clone();
    let done = EventFrame::new(
        methods::EVENT_CHAT_RESPONSE,
        json!({ "id": req_id, "sessionId": session_id, "text": text }),
    );
    let _ = out_tx.send(done.to_json()).await;

    Ok(json!({ "sessionId": session_id, "text": text }))
}

#[derive(Deserialize)]
struct ChatAbortParams {
    id: String,
}

pub async fn chat_abort(state: &Arc<AppState>, conn_id: &str, params: Value) -> Result<Value> {
    let p: ChatAbortParams = parse_params(params)?;
    let key = format!("{conn_id}/{}", p.id);
    match state.active_streams.remove(&key) {
        Some((_, token)) => {
            token.cancel();
            Ok(json!({ "aborted": true }))
        }
        None => Err(HayaError::NotFound(format!("stream '{}'", p.id))),
    }
}

async fn load_history(state: &Arc<AppState>, session_id: &str) -> Result<Vec<Message>> {
    let compaction = state.config.agent.compaction.as_ref();
    let opts = HistoryOptions {
        max_tokens: compaction.map(|c| c.max_tokens),
        reserve_for_response: compaction.map(|c| c.reserve_for_response).unwrap_or(0),
        recent_message_count: compaction.map(|c| c.recent_message_count).unwrap_or(10),
        system_prompt_tokens: haya_agent::pipeline::tokens::estimate_text(
            &state.config.agent.system_prompt,
        ),
        context_pruning: state.config.agent.context_pruning.clone(),
    };
    let history = if compaction.is_some_and(|c| c.summarize) {
        let summarizer = Summarizer {
            provider: state.runtime.provider().as_ref(),
            model: state.runtime.default_model().to_string(),
            reserve_tokens: opts.reserve_for_response,
        };
        state
            .history
            .get_history_async(session_id, &opts, Some(&summarizer))
            .await?
    } else {
        state.history.get_history_async(session_id, &opts, None).await?
    };
    Ok(history)
}

// --- sessions ---------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdParams {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionCreateParams {
    session_id: String,
    title: Option<String>,
}

pub async fn sessions_list(state: &Arc<AppState>) -> Result<Value> {
    let items = state.store.list().map_err(HayaError::from)?;
    Ok(json!({ "sessions": items }))
}

pub async fn sessions_create(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: SessionCreateParams = parse_params(params)?;
    state
        .store
        .create(&p.session_id, Some(SessionMeta::new(p.title, None)))
        .map_err(HayaError::from)?;
    Ok(json!({ "sessionId": p.session_id }))
}

pub async fn sessions_delete(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: SessionIdParams = parse_params(params)?;
    state.store.delete(&p.session_id).map_err(HayaError::from)?;
    Ok(json!({ "deleted": true }))
}

pub async fn sessions_history(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: SessionIdParams = parse_params(params)?;
    let messages = state
        .store
        .read_messages(&p.session_id)
        .map_err(HayaError::from)?;
    Ok(json!({ "sessionId": p.session_id, "messages": messages }))
}

// --- channels ---------------------------------------------------------------

#[derive(Deserialize)]
struct ChannelIdParams {
    id: String,
}

pub async fn channels_list(state: &Arc<AppState>) -> Result<Value> {
    let channels: Vec<Value> = state
        .dock
        .statuses()
        .into_iter()
        .map(|(id, status)| {
            let caps = state
                .dock
                .plugin(&id)
                .map(|p| p.capabilities())
                .unwrap_or_default();
            json!({ "id": id, "status": status, "capabilities": caps })
        })
        .collect();
    Ok(json!({ "channels": channels }))
}

pub async fn channels_start(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: ChannelIdParams = parse_params(params)?;
    let settings = state
        .config
        .channels
        .get(&p.id)
        .map(|e| serde_json::to_value(&e.settings).unwrap_or(json!({})))
        .unwrap_or(json!({}));
    state
        .dock
        .start(&p.id, &settings)
        .await
        .map_err(|e| HayaError::Internal(e.to_string()))?;
    Ok(json!({ "started": p.id }))
}

pub async fn channels_stop(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: ChannelIdParams = parse_params(params)?;
    state
        .dock
        .stop(&p.id)
        .await
        .map_err(|e| HayaError::Internal(e.to_string()))?;
    Ok(json!({ "stopped": p.id }))
}

// --- cron -------------------------------------------------------------------

#[derive(Deserialize)]
struct CronAddParams {
    name: String,
    schedule: String,
    action: String,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct CronRemoveParams {
    id: String,
}

pub async fn cron_list(state: &Arc<AppState>) -> Result<Value> {
    Ok(json!({ "jobs": state.scheduler.store().list() }))
}

pub async fn cron_status(state: &Arc<AppState>) -> Result<Value> {
    let jobs = state.scheduler.store().list();
    let armed = jobs
        .iter()
        .filter(|j| state.scheduler.is_armed(&j.id))
        .count();
    Ok(json!({
        "total": jobs.len(),
        "enabled": jobs.iter().filter(|j| j.enabled).count(),
        "armed": armed,
    }))
}

pub async fn cron_add(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: CronAddParams = parse_params(params)?;
    let job = state
        .scheduler
        .add_job(&p.name, &p.schedule, &p.action, p.metadata)
        .map_err(HayaError::from)?;
    Ok(json!({ "job": job }))
}

pub async fn cron_remove(state: &Arc<AppState>, params: Value) -> Result<Value> {
    let p: CronRemoveParams = parse_params(params)?;
    state.scheduler.remove_job(&p.id).map_err(HayaError::from)?;
    Ok(json!({ "removed": p.id }))
}
