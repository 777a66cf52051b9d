//! API route handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use zapflow_core::error::ZapflowError;
use zapflow_core::types::ChannelFamily;
use zapflow_dispatch::DispatchJob;
use zapflow_dispatch::job::new_session_id;
use zapflow_dispatch::progress::CurrentRecipient;

use super::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

fn ok(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn fail(status: StatusCode, error: impl std::fmt::Display) -> ApiResponse {
    (status, Json(json!({"success": false, "error": error.to_string()})))
}

fn status_for(err: &ZapflowError) -> StatusCode {
    match err {
        ZapflowError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
        ZapflowError::InvalidJob(_) | ZapflowError::Progress(_) => StatusCode::BAD_REQUEST,
        ZapflowError::Channel(_) | ZapflowError::GatewaySend(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let registry = state.engine.registry();
    let connected = registry.list(None, None).iter().filter(|c| c.is_connected()).count();
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "channels": registry.len(),
        "connected": connected,
        "activeDispatches": state.engine.cancellations().active(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressQuery {
    session_id: Option<String>,
}

/// `GET ?sessionId=X`. Unknown sessions answer `progress: null`, not 404.
pub async fn get_progress(State(state): State<Arc<AppState>>, Query(q): Query<ProgressQuery>) -> ApiResponse {
    let Some(session_id) = q.session_id.filter(|s| !s.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "sessionId is required");
    };
    match state.engine.progress().read(&session_id).await {
        Ok(progress) => ok(json!({"success": true, "progress": progress})),
        Err(e) => fail(status_for(&e), e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressCommand {
    session_id: String,
    action: String,
    #[serde(default)]
    data: Value,
}

/// `POST {sessionId, action, data}` for producers outside this process.
pub async fn post_progress(State(state): State<Arc<AppState>>, Json(cmd): Json<ProgressCommand>) -> ApiResponse {
    if cmd.session_id.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "sessionId is required");
    }
    let store = state.engine.progress();
    let id = cmd.session_id.as_str();

    let result = match cmd.action.as_str() {
        "start" => {
            let total = cmd.data["totalMessages"].as_u64().unwrap_or(0).min(u32::MAX as u64) as u32;
            store.start(id, total).await
        }
        "updateCurrent" => {
            let current = if cmd.data.is_null() {
                None
            } else {
                match serde_json::from_value::<CurrentRecipient>(cmd.data) {
                    Ok(c) => Some(c),
                    Err(e) => return fail(StatusCode::BAD_REQUEST, format!("invalid recipient data: {e}")),
                }
            };
            store.update_current(id, current).await
        }
        "markSent" => store.mark_sent(id).await,
        "markFailed" => store.mark_failed(id).await,
        "finish" => store.finish(id).await,
        "error" => {
            let reason = cmd.data["errorMessage"]
                .as_str()
                .or_else(|| cmd.data["reason"].as_str())
                .map(String::from);
            store.mark_error(id, reason).await
        }
        "clear" => store.clear(id).await,
        other => return fail(StatusCode::BAD_REQUEST, format!("unknown action: {other}")),
    };

    match result {
        Ok(()) => ok(json!({"success": true})),
        Err(e) => fail(status_for(&e), e),
    }
}

/// Validate, spawn and return the session id to poll.
pub async fn submit_dispatch(State(state): State<Arc<AppState>>, Json(mut job): Json<DispatchJob>) -> ApiResponse {
    if job.session_id.is_empty() {
        job.session_id = new_session_id();
    }
    let session_id = job.session_id.clone();
    match state.engine.spawn(job) {
        Ok(_handle) => ok(json!({"success": true, "sessionId": session_id})),
        Err(e) => fail(status_for(&e), e),
    }
}

pub async fn stop_dispatch(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> ApiResponse {
    if state.engine.cancellations().cancel(&session_id) {
        ok(json!({"success": true}))
    } else {
        fail(StatusCode::NOT_FOUND, format!("no running dispatch {session_id}"))
    }
}

/// Live state of a running job, or the stored summary and per-recipient
/// outcomes once it has finished.
pub async fn dispatch_status(State(state): State<Arc<AppState>>, Path(session_id): Path<String>) -> ApiResponse {
    if let Some(live) = state.engine.cancellations().state(&session_id) {
        return ok(json!({"success": true, "sessionId": session_id, "state": live}));
    }
    let Some(history) = state.engine.history() else {
        return fail(StatusCode::NOT_FOUND, format!("no running dispatch {session_id}"));
    };
    let job = match history.job(&session_id) {
        Ok(Some(job)) => job,
        Ok(None) => return fail(StatusCode::NOT_FOUND, format!("unknown dispatch {session_id}")),
        Err(e) => return fail(status_for(&e), e),
    };
    match history.outcomes(&session_id) {
        Ok(outcomes) => ok(json!({
            "success": true,
            "sessionId": session_id,
            "state": job.state,
            "job": job,
            "outcomes": outcomes,
        })),
        Err(e) => fail(status_for(&e), e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchListQuery {
    user_id: Option<String>,
    limit: Option<usize>,
}

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

/// `GET ?userId=X&limit=N`: an owner's most recent finished jobs.
pub async fn list_dispatches(State(state): State<Arc<AppState>>, Query(q): Query<DispatchListQuery>) -> ApiResponse {
    let Some(user_id) = q.user_id.filter(|u| !u.is_empty()) else {
        return fail(StatusCode::BAD_REQUEST, "userId is required");
    };
    let Some(history) = state.engine.history() else {
        return fail(StatusCode::NOT_FOUND, "delivery log disabled");
    };
    let limit = q.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
    match history.recent_jobs(&user_id, limit) {
        Ok(jobs) => ok(json!({"success": true, "jobs": jobs})),
        Err(e) => fail(status_for(&e), e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelQuery {
    user_id: Option<String>,
    family: Option<String>,
}

pub async fn list_channels(State(state): State<Arc<AppState>>, Query(q): Query<ChannelQuery>) -> ApiResponse {
    let family = match q.family.as_deref().filter(|f| !f.is_empty()) {
        Some(raw) => match raw.parse::<ChannelFamily>() {
            Ok(f) => Some(f),
            Err(e) => return fail(StatusCode::BAD_REQUEST, e),
        },
        None => None,
    };
    let channels = state.engine.registry().list(q.user_id.as_deref(), family);
    ok(json!({"success": true, "channels": channels}))
}

pub async fn refresh_channel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.engine.registry().refresh_health(&id).await {
        Ok(s) => ok(json!({"success": true, "state": s})),
        Err(e) => fail(status_for(&e), e),
    }
}

pub async fn reconnect_channel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.engine.registry().reconnect(&id).await {
        Ok(()) => {
            tracing::info!("🔄 Reconnect requested for channel {}", id);
            ok(json!({"success": true}))
        }
        Err(e) => fail(status_for(&e), e),
    }
}
