use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, info, warn};

use xchange_types::api::Claims;
use xchange_types::events::{RelayCommand, RelayEvent};

use crate::relay::Relay;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket may stay silent before sending `join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one realtime client from handshake to close.
///
/// Disconnected -> (join) -> Connected -> (transport close) -> Disconnected.
/// The client's first frame must be a `join` whose token subject matches the
/// identity it asks to subscribe as.
pub async fn handle_connection(socket: WebSocket, relay: Relay, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let identity_id = match wait_for_join(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("Realtime client failed to join, closing");
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    // Subscribe before acknowledging so that `ready` means "receiving".
    let (conn_id, mut events_rx) = relay.connect(&identity_id).await;
    info!("{} joined the relay (conn {})", identity_id, conn_id);

    let ready = RelayEvent::Ready {
        identity_id: identity_id.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        relay.unsubscribe(&identity_id, conn_id).await;
        return;
    }

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward relay events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    // None: a newer connection for this identity took over
                    let Some(event) = event else {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_identity = identity_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RelayCommand>(&text) {
                    Ok(RelayCommand::Join { .. }) => {
                        debug!("{} sent a second join, ignoring", recv_identity);
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_identity,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    relay.unsubscribe(&identity_id, conn_id).await;
    info!("{} left the relay (conn {})", identity_id, conn_id);
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &RelayEvent,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode relay event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn wait_for_join(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<String> {
    let join = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(RelayCommand::Join { identity_id, token }) =
                    serde_json::from_str::<RelayCommand>(&text)
                {
                    return verify_join(&identity_id, &token, jwt_secret);
                }
            }
        }
        None
    });

    join.await.ok().flatten()
}

/// Accept the join only when the token is valid and names `identity_id`.
pub fn verify_join(identity_id: &str, token: &str, jwt_secret: &str) -> Option<String> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    if token_data.claims.sub != identity_id {
        warn!(
            "Join for {} presented a token for {}",
            identity_id, token_data.claims.sub
        );
        return None;
    }
    Some(token_data.claims.sub)
}
