use std::sync::Arc;

use jsonwebtoken::{EncodingKey, Header, encode};

use xchange_gateway::relay::Relay;
use xchange_types::api::Claims;
use xchange_types::models::Role;

use crate::service::MessagingService;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub messaging: MessagingService,
    pub relay: Relay,
    pub jwt_secret: String,
}

/// Mint a bearer token in the format the middleware and the realtime join
/// handshake accept. Issuing tokens belongs to the login collaborator; this
/// is its contract.
pub fn issue_token(secret: &str, identity_id: &str, role: Role, ttl: chrono::Duration) -> anyhow::Result<String> {
    let claims = Claims {
        sub: identity_id.to_string(),
        role,
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
