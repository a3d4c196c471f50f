use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::info;

use xchange_types::api::DeleteMessagingResponse;
use xchange_types::models::Role;

use crate::auth::AppState;
use crate::error::{ApiError, MessagingError};
use crate::service::Caller;

/// DELETE /admin/identities/{id}/messaging — account-deletion cascade hook.
pub async fn delete_identity_messaging(
    State(state): State<AppState>,
    Path(identity_id): Path<String>,
    Extension(caller): Extension<Caller>,
) -> Result<impl IntoResponse, ApiError> {
    if caller.role != Role::Admin {
        return Err(MessagingError::Forbidden.into());
    }

    info!("Admin {} purging messaging data of {}", caller.id, identity_id);
    let (deleted_conversations, deleted_messages) = state
        .messaging
        .delete_all_for_identity(&identity_id)
        .await?;

    Ok(Json(DeleteMessagingResponse {
        deleted_conversations,
        deleted_messages,
    }))
}
