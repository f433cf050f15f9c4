use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use parley_types::events::{
    AckFrame, ErrorCode, ErrorFrame, GatewayCommand, GatewayEvent, ReadyFrame, SendMessage,
};
use parley_types::models::MessageStatus;

use crate::Gateway;
use crate::handle::ConnectionHandle;

/// `tokio::time::interval` panics on a zero period.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Connection lifecycle. Leaving the read loop is the terminal `Closed`
/// state, handled once in `handle_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Authenticated { user_id: String },
}

pub async fn ws_upgrade(
    State(gateway): State<Gateway>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, gateway))
}

/// Drive one WebSocket connection from upgrade to close.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway) {
    let (sender, receiver) = socket.split();
    let (handle, outbound_rx) = ConnectionHandle::new(gateway.config().outbound_capacity);
    debug!("connection {} opened", handle.conn_id());

    let pong_received = Arc::new(AtomicBool::new(true));

    let mut send_task = tokio::spawn(run_writer(
        sender,
        outbound_rx,
        pong_received.clone(),
        gateway.config().heartbeat_interval,
    ));

    let recv_gateway = gateway.clone();
    let recv_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        run_reader(receiver, recv_gateway, recv_handle, pong_received).await;
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.relay.handle_disconnect(&handle).await;
    match handle.user_id() {
        Some(user_id) => info!("{} disconnected (connection {})", user_id, handle.conn_id()),
        None => debug!("connection {} closed before auth", handle.conn_id()),
    }
}

/// Forward queued frames to the socket and keep the heartbeat going.
async fn run_writer(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<GatewayEvent>,
    pong_flag: Arc<AtomicBool>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL));
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_flag.swap(false, Ordering::Acquire) {
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
}

/// Read frames in arrival order until the peer goes away.
async fn run_reader(
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    handle: ConnectionHandle,
    pong_flag: Arc<AtomicBool>,
) {
    let mut state = ConnectionState::Connecting;
    let auth_deadline = tokio::time::sleep(gateway.config().auth_timeout);
    tokio::pin!(auth_deadline);

    loop {
        let frame = if state == ConnectionState::Connecting {
            tokio::select! {
                frame = receiver.next() => frame,
                _ = &mut auth_deadline => {
                    warn!("connection {} did not authenticate in time, closing", handle.conn_id());
                    break;
                }
            }
        } else {
            receiver.next().await
        };

        let msg = match frame {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!("connection {} read error: {}", handle.conn_id(), e);
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => {
                state = handle_frame(&gateway, &handle, state, text.as_str()).await;
            }
            Message::Pong(_) => {
                pong_flag.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_frame(
    gateway: &Gateway,
    handle: &ConnectionHandle,
    state: ConnectionState,
    text: &str,
) -> ConnectionState {
    let cmd = match serde_json::from_str::<GatewayCommand>(text) {
        Ok(cmd) => cmd,
        Err(e) => {
            let raw: String = text.chars().take(200).collect();
            warn!("connection {} bad frame: {} -- raw: {}", handle.conn_id(), e, raw);
            return state;
        }
    };

    match (state, cmd) {
        (ConnectionState::Connecting, GatewayCommand::Auth(auth)) => {
            if authenticate(gateway, handle, &auth.user_id).await {
                ConnectionState::Authenticated {
                    user_id: auth.user_id,
                }
            } else {
                ConnectionState::Connecting
            }
        }
        (ConnectionState::Connecting, GatewayCommand::Message(_)) => {
            warn!("connection {} sent a message before auth, ignoring", handle.conn_id());
            ConnectionState::Connecting
        }
        (ConnectionState::Authenticated { user_id }, GatewayCommand::Auth(auth)) => {
            if authenticate(gateway, handle, &auth.user_id).await {
                ConnectionState::Authenticated {
                    user_id: auth.user_id,
                }
            } else {
                ConnectionState::Authenticated { user_id }
            }
        }
        (ConnectionState::Authenticated { user_id }, GatewayCommand::Message(send)) => {
            dispatch_send(gateway, handle, &user_id, send).await;
            ConnectionState::Authenticated { user_id }
        }
    }
}

/// Check the user exists, then register this connection for it.
async fn authenticate(gateway: &Gateway, handle: &ConnectionHandle, user_id: &str) -> bool {
    let accounts = gateway.accounts.clone();
    let lookup_id = user_id.to_string();
    let known = tokio::task::spawn_blocking(move || accounts.user_exists(&lookup_id)).await;

    let error = match known {
        Ok(Ok(true)) => None,
        Ok(Ok(false)) => Some((ErrorCode::UnknownUser, format!("unknown user '{}'", user_id))),
        Ok(Err(e)) => {
            error!("account lookup for {} failed: {:#}", user_id, e);
            Some((ErrorCode::Store, "account lookup failed".to_string()))
        }
        Err(e) => {
            error!("account lookup task failed: {}", e);
            Some((ErrorCode::Store, "account lookup failed".to_string()))
        }
    };

    if let Some((code, message)) = error {
        warn!("connection {} auth rejected: {}", handle.conn_id(), message);
        let _ = handle.push(GatewayEvent::Error(ErrorFrame {
            id: None,
            code,
            message,
        }));
        return false;
    }

    gateway.relay.handle_auth(handle, user_id).await;
    info!("{} connected to gateway (connection {})", user_id, handle.conn_id());

    let _ = handle.push(GatewayEvent::Ready(ReadyFrame {
        user_id: user_id.to_string(),
    }));
    true
}

/// Hand a send to the relay and report the result to this connection only.
///
/// The relay call runs in its own task: the reader waits for it, so frames
/// stay ordered, but a disconnect that aborts the reader does not abort a
/// send already in flight.
async fn dispatch_send(
    gateway: &Gateway,
    handle: &ConnectionHandle,
    user_id: &str,
    send: SendMessage,
) {
    let id = send.id.clone();

    if send.sender_id.as_deref().is_some_and(|sender| sender != user_id) {
        warn!("{} tried to send as {:?}", user_id, send.sender_id);
        let _ = handle.push(GatewayEvent::Error(ErrorFrame {
            id,
            code: ErrorCode::Validation,
            message: "senderId does not match the authenticated user".into(),
        }));
        return;
    }

    let relay = gateway.relay.clone();
    let result = tokio::spawn(async move { relay.handle_send(send).await }).await;

    let reply = match result {
        Ok(Ok(outcome)) => {
            debug!(
                "{} -> {} message {} (pushed: {}, duplicate: {})",
                user_id,
                outcome.message.receiver_id,
                outcome.message.id,
                outcome.pushed,
                outcome.duplicate
            );
            GatewayEvent::Ack(AckFrame {
                id: outcome.message.id,
                status: MessageStatus::Sent,
                duplicate: outcome.duplicate,
            })
        }
        Ok(Err(e)) => {
            warn!("{} send rejected: {}", user_id, e);
            GatewayEvent::Error(ErrorFrame {
                id,
                code: e.code(),
                message: e.to_string(),
            })
        }
        Err(e) => {
            error!("send task for {} failed: {}", user_id, e);
            GatewayEvent::Error(ErrorFrame {
                id,
                code: ErrorCode::Store,
                message: "send failed".into(),
            })
        }
    };

    let _ = handle.push(reply);
}
