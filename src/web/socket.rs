//! WebSocket handlers: per-session subscriber sockets and the monitoring
//! socket.
//!
//! A subscriber socket never touches session state directly: it submits
//! parsed messages to the session and drains its bounded queue. Malformed
//! inbound JSON is acknowledged and dropped without disturbing the session
//! or other subscribers.

use crate::core::command::CommandSource;
use crate::core::session::Session;
use crate::web::protocol::{ClientMessage, ServerMessage};
use crate::web::WebState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// `GET /ws/session/{name}` — upgrade to a per-session subscriber.
pub async fn session_ws(
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
) -> impl IntoResponse {
    match state.registry.get(&name).await {
        Ok(session) => ws
            .on_upgrade(move |socket| handle_session_socket(socket, session))
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

/// `GET /ws/monitoring` — session-agnostic monitoring socket.
pub async fn monitoring_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WebState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_monitoring_socket(socket, state))
}

async fn handle_session_socket(socket: WebSocket, session: Arc<Session>) {
    let Some((subscriber_id, mut queue_rx)) = session.attach_subscriber() else {
        debug!("subscriber rejected, session is shutting down");
        return;
    };
    debug!(
        "SSH[{}] websocket subscriber {} connected",
        session.name(),
        subscriber_id
    );

    let (mut sink, mut stream) = socket.split();

    // Outbound: drain the subscriber queue into the socket. Ends when the
    // broadcaster drops the queue (overflow or session shutdown).
    let send_task = tokio::spawn(async move {
        while let Some(msg) = queue_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize server message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound: parse and route until the client goes away.
    while let Some(result) = stream.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!("websocket receive error: {}", e);
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                handle_client_message(&session, subscriber_id, text.as_str()).await;
            }
            Message::Close(_) => break,
            // Binary frames are not part of the protocol; acknowledge and
            // drop like any other malformed input.
            Message::Binary(_) => {
                session.send_to_subscriber(subscriber_id, ServerMessage::MalformedMessageHandled);
            }
            _ => {}
        }
    }

    session.detach_subscriber(subscriber_id);
    send_task.abort();
    debug!(
        "SSH[{}] websocket subscriber {} disconnected",
        session.name(),
        subscriber_id
    );
}

async fn handle_client_message(session: &Arc<Session>, subscriber_id: u64, text: &str) {
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(
                "SSH[{}] malformed websocket message dropped: {}",
                session.name(),
                e
            );
            session.send_to_subscriber(subscriber_id, ServerMessage::MalformedMessageHandled);
            return;
        }
    };

    match msg {
        ClientMessage::TerminalInput {
            command,
            command_id,
            source,
            ..
        } => {
            let source = source.unwrap_or(CommandSource::User);
            let reported_id = command_id.clone().unwrap_or_default();
            if let Err(e) = session.submit_from_browser(&command, command_id, source) {
                session.report_command_error(subscriber_id, &reported_id, source, &e.to_string());
            }
        }
        ClientMessage::TerminalInputRaw { data } => {
            if let Err(e) = session.write_raw(data.as_bytes()).await {
                debug!("SSH[{}] raw input write failed: {}", session.name(), e);
            }
        }
        ClientMessage::TerminalSignal { signal, .. } => {
            if signal == "SIGINT" {
                session.signal_interrupt().await;
            } else {
                warn!(
                    "SSH[{}] unsupported signal {:?} requested",
                    session.name(),
                    signal
                );
            }
        }
        ClientMessage::TerminalResize { cols, rows } => {
            if let Err(e) = session.resize(cols, rows).await {
                debug!("SSH[{}] resize failed: {}", session.name(), e);
            }
        }
        ClientMessage::RequestStateRecovery { .. } => {
            session.recover_state(subscriber_id);
        }
    }
}

async fn handle_monitoring_socket(socket: WebSocket, state: Arc<WebState>) {
    debug!("monitoring websocket connected");
    let (mut sink, mut stream) = socket.split();
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sessions = state.registry.list().await;
                let msg = ServerMessage::SessionList { sessions };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
    debug!("monitoring websocket disconnected");
}
