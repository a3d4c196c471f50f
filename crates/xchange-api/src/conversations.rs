use axum::{
    Extension, Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use xchange_types::api::{
    CreateConversationRequest, CreateConversationResponse, SendMessageRequest, UnreadResponse,
};

use crate::auth::AppState;
use crate::error::ApiError;
use crate::service::Caller;

/// GET /conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = state.messaging.list_conversations(&caller.id).await?;
    Ok(Json(summaries))
}

/// POST /conversations — find or open a conversation with the recipient.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<CreateConversationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let opened = state
        .messaging
        .get_or_create_conversation(&caller, &req.recipient_id, req.product_ref.as_deref())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateConversationResponse {
            conversation_id: opened.conversation_id,
            is_new: opened.is_new,
        }),
    ))
}

/// GET /conversations/unread
pub async fn unread_total(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, ApiError> {
    let unread = state.messaging.unread_total(&caller.id).await?;
    Ok(Json(UnreadResponse { unread }))
}

/// GET /conversations/{id}/messages — also marks the thread read for the caller.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .messaging
        .get_messages(&conversation_id, &caller.id)
        .await?;
    Ok(Json(messages))
}

/// POST /conversations/{id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body?;
    let message = state
        .messaging
        .send_message(&conversation_id, &caller.id, &req.body, req.product_context)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}
