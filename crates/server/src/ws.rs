use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use server_api::accounts;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{LiveEvent, LiveRequest},
};
use storage::StoredUser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| live_session(state, socket))
}

/// One task per connection: an in-band login handshake, then a forwarding
/// loop until the transport closes. The registry entry is released by the
/// session guard on every exit path.
async fn live_session(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let Some(user) = handshake(&state, &mut sink, &mut stream).await else {
        let _ = sink.close().await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let _session = state.api.registry.register(user.id, tx);
    info!(user_id = user.id.0, "live session registered");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else { break };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if sink.send(Message::Text(client_frame_reply(&text))).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(user_id = user.id.0, %err, "live connection errored");
                        break;
                    }
                }
            }
        }
    }

    info!(user_id = user.id.0, "live session closed");
}

/// The first client frame must be a login envelope; anything else ends the
/// connection before it is registered for delivery.
async fn handshake(
    state: &AppState,
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
) -> Option<StoredUser> {
    let first = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return None,
        }
    };

    let (username, password) = match serde_json::from_str::<LiveRequest>(&first) {
        Ok(LiveRequest::Login { username, password }) => (username, password),
        Err(_) => {
            send_event(
                sink,
                &LiveEvent::Error(ApiError::new(ErrorCode::Validation, "expected a login frame")),
            )
            .await;
            return None;
        }
    };

    match accounts::login(&state.api, &username, &password).await {
        Ok(user) => {
            send_event(
                sink,
                &LiveEvent::Ready {
                    user: accounts::profile(&user),
                },
            )
            .await;
            Some(user)
        }
        Err(err) => {
            send_event(sink, &LiveEvent::Error(ApiError::from(&err))).await;
            None
        }
    }
}

async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &LiveEvent) {
    if let Ok(text) = serde_json::to_string(event) {
        let _ = sink.send(Message::Text(text)).await;
    }
}

fn client_frame_reply(text: &str) -> String {
    let reply = match serde_json::from_str::<LiveRequest>(text) {
        Ok(LiveRequest::Login { .. }) => ApiError::new(ErrorCode::Conflict, "already logged in"),
        Err(_) => ApiError::new(ErrorCode::Validation, "unrecognized frame"),
    };
    serde_json::to_string(&LiveEvent::Error(reply)).unwrap_or_default()
}
