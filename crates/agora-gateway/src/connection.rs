use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agora_types::events::{ClientCommand, ErrorCode, ServerEvent, close_code};

use crate::error::HubError;
use crate::hub::Hub;
use crate::sessions::{Outbound, SessionHandle};

const NORMAL_CLOSURE: u16 = 1000;
const INTERNAL_ERROR: u16 = 1011;
/// Close reasons must fit in a control frame (125 bytes minus the code).
const MAX_CLOSE_REASON: usize = 120;
/// How long the writer gets to flush a close frame once the reader is done.
const CLOSE_FLUSH: Duration = Duration::from_secs(5);

/// Milliseconds of the last inbound frame, relative to connection start.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Acquire)))
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    let mut end = reason.len().min(MAX_CLOSE_REASON);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    Message::Close(Some(CloseFrame {
        code,
        reason: reason[..end].to_string().into(),
    }))
}

fn handshake_close_code(err: &HubError) -> u16 {
    match err {
        HubError::Auth(_) => close_code::UNAUTHORIZED,
        HubError::SanctionDenied(_) => close_code::FORBIDDEN,
        _ => INTERNAL_ERROR,
    }
}

/// Serve one WebSocket client. The token was taken from the upgrade request;
/// it is verified here so a rejected handshake still gets a proper close code.
pub async fn handle_connection(socket: WebSocket, hub: Hub, token: String) {
    let (mut sender, receiver) = socket.split();

    let connected = match hub.connect(&token).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!("gateway handshake rejected: {}", e);
            let reason = match &e {
                HubError::Persistence(_) => "internal error".to_string(),
                other => other.to_string(),
            };
            let _ = sender.send(close_frame(handshake_close_code(&e), &reason)).await;
            return;
        }
    };

    let session = connected.session;
    let text = match serde_json::to_string(&connected.ready) {
        Ok(text) => text,
        Err(e) => {
            warn!(session = %session.id, "failed to encode ready event: {}", e);
            hub.disconnect(session.id).await;
            return;
        }
    };
    if sender.send(Message::Text(text.into())).await.is_err() {
        hub.disconnect(session.id).await;
        return;
    }

    run_connection_loop(sender, receiver, connected.events, hub, session).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut events: mpsc::Receiver<Outbound>,
    hub: Hub,
    session: Arc<SessionHandle>,
) {
    let activity = Arc::new(Activity::new());
    let heartbeat_interval = hub.config().heartbeat_interval;
    let idle_timeout = hub.config().idle_timeout;

    // Queue -> socket, plus heartbeat and idle/expiry checks.
    let send_session = session.clone();
    let send_activity = activity.clone();
    let mut send_task = tokio::spawn(async move {
        let session = send_session;
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = session.closed() => {
                    let (code, reason) = session
                        .close_reason()
                        .map(|r| (r.code, r.reason))
                        .unwrap_or((NORMAL_CLOSURE, "closed"));
                    debug!(session = %session.id, code, reason, "closing socket");
                    let _ = sender.send(close_frame(code, reason)).await;
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&*event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(session = %session.id, "failed to encode event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if send_activity.idle_for() >= idle_timeout {
                        info!(session = %session.id, "idle timeout");
                        session.close(close_code::IDLE_TIMEOUT, "idle timeout");
                        continue;
                    }
                    if session.principal().await.is_expired(Utc::now()) {
                        info!(session = %session.id, "token expired");
                        session.close(close_code::UNAUTHORIZED, "token expired");
                        continue;
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Socket -> dispatch. Commands from one session run in arrival order.
    let recv_session = session.clone();
    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        let session = recv_session;
        let hub = recv_hub;
        while let Some(frame) = receiver.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(session = %session.id, "socket read failed: {}", e);
                    break;
                }
            };
            activity.touch();

            let reply = match frame {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        let name = cmd.name();
                        match hub.dispatch(&session, cmd).await {
                            Ok(reply) => reply,
                            Err(e) => {
                                debug!(session = %session.id, command = name, "command rejected: {}", e);
                                Some(e.to_event(Some(name)))
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            session = %session.id,
                            "bad command: {} -- raw: {}",
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        Some(ServerEvent::Error {
                            code: ErrorCode::BadCommand,
                            message: format!("malformed command: {}", e),
                            command: None,
                        })
                    }
                },
                Message::Binary(_) => Some(ServerEvent::Error {
                    code: ErrorCode::BadCommand,
                    message: "binary frames are not supported".into(),
                    command: None,
                }),
                Message::Close(_) => break,
                // Ping/Pong only count as activity.
                _ => None,
            };

            if let Some(reply) = reply {
                if let Err(e) = hub.sessions().send(session.id, Arc::new(reply)).await {
                    debug!(session = %session.id, "reply dropped: {}", e);
                }
            }
            if session.is_closing() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {
            // Let the writer flush the close frame.
            session.close(NORMAL_CLOSURE, "closed");
            if tokio::time::timeout(CLOSE_FLUSH, &mut send_task).await.is_err() {
                send_task.abort();
            }
        }
    }

    hub.disconnect(session.id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_is_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let Message::Close(Some(frame)) = close_frame(4401, &long) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 4401);
        assert!(frame.reason.as_str().len() <= MAX_CLOSE_REASON);
        assert!(frame.reason.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn handshake_failures_map_to_close_codes() {
        assert_eq!(handshake_close_code(&HubError::Auth("bad".into())), 4401);
        assert_eq!(handshake_close_code(&HubError::SanctionDenied("banned".into())), 4403);
        assert_eq!(handshake_close_code(&HubError::Persistence("db".into())), 1011);
    }

    #[tokio::test(start_paused = true)]
    async fn activity_measures_idle_time() {
        let activity = Activity::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(activity.idle_for() >= Duration::from_secs(3));
        activity.touch();
        assert!(activity.idle_for() < Duration::from_secs(1));
    }
}
