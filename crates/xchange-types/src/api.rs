use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ProductContext, ProductSummary, Role};

// -- JWT Claims --

/// Bearer token claims shared by the REST middleware and the realtime
/// gateway's join handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize,
}

// -- Conversations --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub recipient_id: String,
    #[serde(default)]
    pub product_ref: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationResponse {
    pub conversation_id: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtherParty {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub other_party: OtherParty,
    pub last_message_preview: String,
    pub last_message_at: DateTime<Utc>,
    pub unread: bool,
    pub unread_count: u32,
    #[serde(default)]
    pub product: Option<ProductSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadResponse {
    pub unread: u64,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub product_context: Option<ProductContext>,
}

// -- Admin --

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessagingResponse {
    pub deleted_conversations: usize,
    pub deleted_messages: usize,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
