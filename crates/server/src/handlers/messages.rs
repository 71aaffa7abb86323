//! REST message handlers
//!
//! Mounted under `/api/messages`, behind `mw_require_auth`.

use crate::config::AppState;
use crate::conversations::conversations_for;
use crate::delivery::{DeliveryOutcome, DeliveryReport};
use crate::error::Result;
use crate::handlers::auth::Ctx;
use crate::models::{Conversation, Message, SendMessageInput};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    Json,
};
use serde_json::{json, Value};
use std::future::Future;
use tokio::time::timeout;
use tracing::{info, warn};

/// Response header carrying the push outcome of a send.
pub static DELIVERY_HEADER: HeaderName = HeaderName::from_static("x-delivery");

async fn bounded<T>(state: &AppState, fut: impl Future<Output = Result<T>>) -> Result<T> {
    timeout(state.config.store_timeout, fut).await?
}

fn created(report: DeliveryReport) -> (StatusCode, HeaderMap, Json<Message>) {
    let outcome = match report.outcome() {
        DeliveryOutcome::Delivered => "delivered",
        DeliveryOutcome::RecipientOffline => "recipient-offline",
    };
    let mut headers = HeaderMap::new();
    headers.insert(DELIVERY_HEADER.clone(), HeaderValue::from_static(outcome));
    (StatusCode::CREATED, headers, Json(report.message))
}

/// POST /api/messages/send
pub async fn send_message(
    ctx: Ctx,
    State(state): State<AppState>,
    Json(input): Json<SendMessageInput>,
) -> Result<(StatusCode, HeaderMap, Json<Message>)> {
    info!("POST /api/messages/send from {}", ctx.user_id());
    let report = state.router.send_direct(ctx.user_id(), input, None).await?;
    Ok(created(report))
}

/// POST /api/messages/group/send
pub async fn send_group_message(
    ctx: Ctx,
    State(state): State<AppState>,
    Json(input): Json<SendMessageInput>,
) -> Result<(StatusCode, HeaderMap, Json<Message>)> {
    info!("POST /api/messages/group/send from {}", ctx.user_id());
    let report = state.router.send_group(ctx.user_id(), input, None).await?;
    Ok(created(report))
}

/// GET /api/messages/conversation/{user_id}
pub async fn get_conversation(
    ctx: Ctx,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Message>>> {
    let messages = bounded(
        &state,
        state.store.find_conversation_between(ctx.user_id(), &user_id),
    )
    .await?;
    Ok(Json(messages))
}

/// GET /api/messages/conversations
pub async fn list_conversations(
    ctx: Ctx,
    State(state): State<AppState>,
) -> Result<Json<Vec<Conversation>>> {
    let mut conversations =
        bounded(&state, conversations_for(state.store.as_ref(), ctx.user_id())).await?;

    for conversation in &mut conversations {
        match state.directory.profile(&conversation.peer_id).await {
            Ok(profile) => conversation.participant = profile,
            Err(e) => warn!("Profile lookup for {} failed: {}", conversation.peer_id, e),
        }
    }

    Ok(Json(conversations))
}

/// GET /api/messages/unread
pub async fn get_unread(ctx: Ctx, State(state): State<AppState>) -> Result<Json<Vec<Message>>> {
    let messages = bounded(&state, state.store.find_unread_for(ctx.user_id())).await?;
    Ok(Json(messages))
}

/// PUT /api/messages/read/{message_id}
pub async fn mark_read(
    ctx: Ctx,
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> Result<Json<Value>> {
    state.router.mark_read(ctx.user_id(), &message_id).await?;
    Ok(Json(json!({ "message": "marked as read" })))
}
