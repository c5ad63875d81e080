//! Per-connection session: the HELLO handshake, rate limits, dispatch
//! into lobby and match, and the outbound pump.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use arena_core::error::Error;
use arena_core::protocol::{close, ClientMessage, ServerMessage};
use arena_core::types::{Session, TxHash, User};
use arena_physics::{Intent, Vec2};

use crate::connection::{ConnectionHandle, Outbound};
use crate::frame::EventFrame;
use crate::gateway::GatewayState;
use crate::lobby::JoinOptions;
use crate::match_manager::now_ms;
use crate::rate_limit::TokenBucket;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_CAPACITY: usize = 256;
const INPUT_RATE_PER_SEC: u32 = 120;
const OTHER_RATE_PER_SEC: u32 = 10;

pub async fn handle_socket(mut socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let ip = addr.ip();
    if !state.app.ip_guard.try_acquire(ip) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close::TOO_MANY_CONNECTIONS,
                reason: Utf8Bytes::from_static("too many connections"),
            })))
            .await;
        return;
    }

    run_session(&mut socket, &state, addr).await;
    state.app.ip_guard.release(ip);
}

async fn run_session(socket: &mut WebSocket, state: &GatewayState, addr: SocketAddr) {
    // First frame must be HELLO with a valid session token.
    let (user, session) = match timeout(HELLO_TIMEOUT, read_hello(socket, state)).await {
        Ok(Some(auth)) => auth,
        Ok(None) | Err(_) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close::INVALID_SESSION,
                    reason: Utf8Bytes::from_static("invalid session"),
                })))
                .await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let conn_id = state.app.connections.next_conn_id();
    let last_rtt_ms = Arc::new(AtomicU64::new(0));
    let handle = ConnectionHandle {
        conn_id,
        user_id: user.id,
        ip: addr.ip(),
        tx: outbound_tx,
        last_rtt_ms: last_rtt_ms.clone(),
    };
    if let Some(old) = state.app.connections.register(handle).await {
        old.close(close::DUPLICATE_RECONNECT, "duplicate connection")
            .await;
    }
    info!("Session opened for {} from {}", user.wallet, addr);

    if let Err(e) = welcome(socket, state, &user, &session).await {
        warn!("Welcome failed for {}: {}", user.wallet, e);
    } else {
        pump(socket, state, &user, &mut outbound_rx, &last_rtt_ms).await;
    }

    // Only the connection that still owns the table entry reports the
    // disconnect; a replaced socket must stay silent.
    let still_current = state
        .app
        .connections
        .get(user.id)
        .await
        .map(|h| h.conn_id == conn_id)
        .unwrap_or(false);
    state.app.connections.remove_if_current(user.id, conn_id).await;
    if still_current {
        if let Some(handle) = state.app.matches.find_for_user(user.id).await {
            handle
                .ports
                .send(EventFrame::PlayerDisconnected { user_id: user.id })
                .await;
        }
    }
    info!("Session closed for {}", user.wallet);
}

async fn read_hello(socket: &mut WebSocket, state: &GatewayState) -> Option<(User, Session)> {
    loop {
        let text = match socket.recv().await? {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        };
        let msg = ClientMessage::decode(text.as_str()).ok()?;
        let ClientMessage::Hello { session_token } = msg else {
            return None;
        };
        return state.app.auth.authenticate(&session_token).await.ok();
    }
}

async fn welcome(
    socket: &mut WebSocket,
    state: &GatewayState,
    user: &User,
    session: &Session,
) -> Result<(), Error> {
    send(
        socket,
        &ServerMessage::Welcome {
            user_id: user.id,
            wallet: user.wallet.to_string(),
        },
    )
    .await?;
    let lobbies = state.app.lobby.lobby_list().await?;
    send(socket, &ServerMessage::LobbyList { lobbies }).await?;

    // Resume: the lobby slot survives disconnects, a live match needs a
    // rotated token and the runner's reconnect state.
    if let Some(lobby_id) = state.app.store.find_active_lobby_for_user(user.id).await? {
        let lobby = state.app.lobby.lobby_summary(lobby_id).await?;
        send(socket, &ServerMessage::LobbyUpdate { lobby }).await?;
    }
    if let Some(handle) = state.app.matches.find_for_user(user.id).await {
        match state.app.auth.rotate(session).await {
            Ok(session_token) => {
                send(socket, &ServerMessage::TokenUpdate { session_token }).await?;
            }
            Err(e) => warn!("Token rotation failed for {}: {}", user.wallet, e),
        }
        handle
            .ports
            .send(EventFrame::PlayerReconnected { user_id: user.id })
            .await;
    }
    Ok(())
}

async fn pump(
    socket: &mut WebSocket,
    state: &GatewayState,
    user: &User,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    last_rtt_ms: &Arc<AtomicU64>,
) {
    let mut input_bucket = TokenBucket::per_second(INPUT_RATE_PER_SEC);
    let mut other_bucket = TokenBucket::per_second(OTHER_RATE_PER_SEC);
    let mut ping_timer = tokio::time::interval(Duration::from_secs(
        state.app.config.net.ping_interval_secs,
    ));
    let mut last_ping_at: Option<Instant> = None;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(msg)) => {
                    if send(socket, &msg).await.is_err() {
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    return;
                }
                None => return,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(socket, state, user, text.as_str(), &mut input_bucket, &mut other_bucket)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    if let Some(at) = last_ping_at.take() {
                        last_rtt_ms.store(at.elapsed().as_millis() as u64, Ordering::Relaxed);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket error for {}: {}", user.wallet, e);
                    return;
                }
            },
            _ = ping_timer.tick() => {
                last_ping_at = Some(Instant::now());
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn handle_text(
    socket: &mut WebSocket,
    state: &GatewayState,
    user: &User,
    raw: &str,
    input_bucket: &mut TokenBucket,
    other_bucket: &mut TokenBucket,
) -> Result<(), ()> {
    let msg = match ClientMessage::decode(raw) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = send(socket, &ServerMessage::error(&e)).await;
            return Ok(());
        }
    };

    let bucket = if matches!(msg, ClientMessage::Input { .. }) {
        input_bucket
    } else {
        other_bucket
    };
    if !bucket.try_take() {
        let _ = send(socket, &ServerMessage::error(&Error::RateLimited)).await;
        return Ok(());
    }

    if let Err(e) = msg.validate(state.profile.allows_dev_tx()) {
        let _ = send(socket, &ServerMessage::error(&e)).await;
        return Ok(());
    }

    match msg {
        ClientMessage::Hello { .. } => {
            // Already authenticated; a second HELLO is noise.
        }
        ClientMessage::JoinLobby {
            lobby_id,
            payment_tx_hash,
        } => {
            let options = if state.profile.verifies_payment() {
                JoinOptions::public()
            } else {
                JoinOptions::admin()
            };
            if let Err(e) = state
                .app
                .lobby
                .join(user, lobby_id, TxHash::new(payment_tx_hash), options)
                .await
            {
                let _ = send(socket, &ServerMessage::error(&e)).await;
            }
        }
        ClientMessage::RequestRefund => {
            if let Err(e) = state.app.lobby.request_refund(user.id).await {
                let _ = send(socket, &ServerMessage::error(&e)).await;
            }
        }
        ClientMessage::Ping { client_time } => {
            let _ = send(
                socket,
                &ServerMessage::Pong {
                    client_time,
                    server_time: now_ms() as f64,
                },
            )
            .await;
        }
        ClientMessage::Input {
            sequence,
            dir_x,
            dir_y,
            target_x,
            target_y,
            frozen,
        } => {
            let intent = match (dir_x, dir_y, target_x, target_y) {
                (Some(x), Some(y), _, _) => Intent::Direction { x, y },
                (_, _, Some(x), Some(y)) => Intent::Target(Vec2::new(x, y)),
                _ => return Ok(()),
            };
            match state.app.matches.find_for_user(user.id).await {
                Some(handle) => {
                    handle
                        .ports
                        .send(EventFrame::PlayerInput {
                            user_id: user.id,
                            sequence,
                            intent,
                            frozen,
                        })
                        .await;
                }
                None => {
                    let _ = send(socket, &ServerMessage::error(&Error::NotInMatch)).await;
                }
            }
        }
    }
    Ok(())
}

async fn send(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), Error> {
    socket
        .send(Message::Text(msg.encode().into()))
        .await
        .map_err(|e| Error::InternalError(e.to_string()))
}
