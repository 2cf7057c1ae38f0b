//! HTTP surface of the coordination server.
//!
//! POST /e2e/keys                     — upload bundle (identity + SPK + OTKs)
//! GET  /e2e/bundle/{user_id}         — fetch-and-claim a peer bundle
//! POST /e2e/keys/replenish           — append one-time publics
//! GET  /e2e/keys/status              — remaining one-time count
//! POST /e2e/group/create             — create group with members
//! POST /e2e/group/{id}/join          — add member
//! POST /e2e/group/{id}/leave         — remove member (bumps key version)
//! POST /e2e/group/{id}/rekey         — force key-version bump
//! GET  /e2e/group/{id}/members       — membership + key version
//! POST /e2e/messages/ephemeral       — enqueue envelope for recipients
//! GET  /e2e/messages                 — list queued envelopes for caller
//! POST /e2e/messages/ack             — drop processed envelopes
//! GET  /e2e/push                     — SSE stream of push notifications
//!
//! Every route takes its caller from the bearer credential; bodies never
//! name the principal.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use futures::stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use efsec_proto::api::{
    AckRequest, BundleResponse, CreateGroupRequest, GroupInfoResponse, GroupRekeyEvent,
    JoinGroupRequest, KeyStatusResponse, ListEnvelopesResponse, PushEvent, ReplenishRequest,
    SendEnvelopeRequest, SendEnvelopeResponse, UploadBundleRequest,
};

use crate::error::ApiError;
use crate::state::{AppState, Principal, ServerEvent};
use crate::{groups, registry, relay};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/e2e/keys", post(upload_bundle))
        .route("/e2e/keys/replenish", post(replenish))
        .route("/e2e/keys/status", get(key_status))
        .route("/e2e/bundle/{user_id}", get(fetch_bundle))
        .route("/e2e/group/create", post(create_group))
        .route("/e2e/group/{group_id}/join", post(join_group))
        .route("/e2e/group/{group_id}/leave", post(leave_group))
        .route("/e2e/group/{group_id}/rekey", post(rekey_group))
        .route("/e2e/group/{group_id}/members", get(group_members))
        .route("/e2e/messages/ephemeral", post(put_envelope))
        .route("/e2e/messages", get(list_envelopes))
        .route("/e2e/messages/ack", post(ack_envelopes))
        .route("/e2e/push", get(push_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── SKR ──────────────────────────────────────────────────────────────────────

async fn upload_bundle(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
    Json(body): Json<UploadBundleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    registry::upload_bundle(&state.pool, &user_id, &body).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn replenish(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReplenishRequest>,
) -> Result<Json<KeyStatusResponse>, ApiError> {
    registry::replenish(&state.pool, &user_id, &body.one_time_keys).await?;
    let remaining = registry::remaining_one_time(&state.pool, &user_id).await?;
    Ok(Json(KeyStatusResponse { remaining_one_time: remaining }))
}

async fn key_status(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
) -> Result<Json<KeyStatusResponse>, ApiError> {
    let remaining = registry::remaining_one_time(&state.pool, &user_id).await?;
    Ok(Json(KeyStatusResponse { remaining_one_time: remaining }))
}

async fn fetch_bundle(
    Principal(_caller): Principal,
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<BundleResponse>, ApiError> {
    let bundle = registry::claim_bundle(&state.pool, &user_id).await?;
    Ok(Json(bundle))
}

// ── SGR ──────────────────────────────────────────────────────────────────────

async fn create_group(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateGroupRequest>,
) -> Result<Json<GroupInfoResponse>, ApiError> {
    let info = groups::create_group(&state.pool, &body.group_id, &user_id, &body.members).await?;
    Ok(Json(info))
}

async fn join_group(
    Principal(caller): Principal,
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(body): Json<JoinGroupRequest>,
) -> Result<Json<GroupInfoResponse>, ApiError> {
    if !groups::is_member(&state.pool, &group_id, &caller).await? {
        return Err(ApiError::Forbidden);
    }
    let info = groups::add_member(&state.pool, &group_id, &body.user_id).await?;
    Ok(Json(info))
}

async fn leave_group(
    Principal(caller): Principal,
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
    Json(body): Json<JoinGroupRequest>,
) -> Result<Json<GroupInfoResponse>, ApiError> {
    if !groups::is_member(&state.pool, &group_id, &caller).await? {
        return Err(ApiError::Forbidden);
    }
    let info = groups::remove_member(&state.pool, &group_id, &body.user_id).await?;
    broadcast_rekey(&state, &info);
    Ok(Json(info))
}

async fn rekey_group(
    Principal(caller): Principal,
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Json<GroupInfoResponse>, ApiError> {
    if !groups::is_member(&state.pool, &group_id, &caller).await? {
        return Err(ApiError::Forbidden);
    }
    let info = groups::bump_key_version(&state.pool, &group_id).await?;
    broadcast_rekey(&state, &info);
    Ok(Json(info))
}

async fn group_members(
    Principal(_caller): Principal,
    State(state): State<Arc<AppState>>,
    Path(group_id): Path<String>,
) -> Result<Json<GroupInfoResponse>, ApiError> {
    let info = groups::group_info(&state.pool, &group_id).await?;
    Ok(Json(info))
}

fn broadcast_rekey(state: &AppState, info: &GroupInfoResponse) {
    let _ = state.push_tx.send(ServerEvent::GroupRekey {
        recipients: info.members.clone(),
        event: GroupRekeyEvent {
            group_id: info.group_id.clone(),
            key_version: info.key_version,
        },
    });
}

// ── ECR ──────────────────────────────────────────────────────────────────────

async fn put_envelope(
    Principal(sender): Principal,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendEnvelopeRequest>,
) -> Result<Json<SendEnvelopeResponse>, ApiError> {
    let payload = URL_SAFE_NO_PAD
        .decode(&body.payload)
        .map_err(|e| ApiError::Validation(format!("payload is not base64: {e}")))?;
    let (envelope_id, received_at) =
        relay::put(&state.pool, &sender, &body.recipients, body.class, &payload).await?;

    for recipient in &body.recipients {
        let _ = state.push_tx.send(ServerEvent::Envelope(PushEvent {
            recipient: recipient.clone(),
            envelope_id,
            class: body.class,
        }));
    }
    Ok(Json(SendEnvelopeResponse { envelope_id, received_at }))
}

async fn list_envelopes(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
) -> Result<Json<ListEnvelopesResponse>, ApiError> {
    let envelopes = relay::list(&state.pool, &user_id).await?;
    Ok(Json(ListEnvelopesResponse { envelopes }))
}

async fn ack_envelopes(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = relay::ack(&state.pool, &user_id, &body.envelope_ids).await?;
    Ok(Json(serde_json::json!({ "acked": removed })))
}

// ── Push ─────────────────────────────────────────────────────────────────────

/// Server-push channel: envelope arrivals and group rekeys for the
/// authenticated principal, as server-sent events.
async fn push_stream(
    Principal(user_id): Principal,
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.push_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |item| {
        let event = item.ok()?;
        let relevant = match &event {
            ServerEvent::Envelope(push) => push.recipient == user_id,
            ServerEvent::GroupRekey { recipients, .. } => recipients.contains(&user_id),
        };
        if !relevant {
            return None;
        }
        let json = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().data(json)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
