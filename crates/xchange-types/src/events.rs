use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Events pushed from the server over the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Join accepted; the connection now receives this identity's events
    Ready {
        #[serde(rename = "identityId")]
        identity_id: String,
    },

    /// A message was persisted in one of the identity's conversations
    Message(Message),
}

/// Commands sent FROM client TO server over the realtime gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RelayCommand {
    /// Subscribe this connection to the caller's own channel
    Join {
        #[serde(rename = "identityId")]
        identity_id: String,
        token: String,
    },
}
