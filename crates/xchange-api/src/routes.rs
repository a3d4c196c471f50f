use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get},
};

use xchange_gateway::connection;

use crate::auth::AppState;
use crate::middleware::require_auth;
use crate::{admin, conversations};

/// All messaging routes. Transport layers (CORS, tracing) are added by the
/// binary.
pub fn router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/conversations/unread", get(conversations::unread_total))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages).post(conversations::send_message),
        )
        .route(
            "/admin/identities/{identity_id}/messaging",
            delete(admin::delete_identity_messaging),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/gateway", get(gateway_upgrade));

    Router::new()
        .merge(protected_routes)
        .merge(public_routes)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn gateway_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let relay = state.relay.clone();
    let secret = state.jwt_secret.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, relay, secret))
}
