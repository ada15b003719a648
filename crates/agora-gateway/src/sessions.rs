use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use agora_types::events::{ServerEvent, close_code};
use agora_types::models::Principal;
use agora_types::{SessionId, UserId};

use crate::error::{HubError, HubResult};

/// Outbound events are shared between every session they fan out to.
pub type Outbound = Arc<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: &'static str,
}

/// One authenticated connection. The connection task owns the receiving end of
/// the queue; everything else talks to the session through this handle.
pub struct SessionHandle {
    pub id: SessionId,
    pub user_id: UserId,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    close: OnceLock<CloseReason>,
    principal: RwLock<Principal>,
    token_hash: RwLock<String>,
}

impl SessionHandle {
    /// Enqueue without waiting. A full queue closes the session; a send to a
    /// session that is already closing is dropped. Returns whether it was queued.
    pub fn push(&self, event: Outbound) -> bool {
        matches!(self.try_push(event), Ok(true))
    }

    /// Like `push`, but a full queue is reported as `Backpressure`.
    /// `Ok(false)` means the session was already going away.
    pub fn try_push(&self, event: Outbound) -> HubResult<bool> {
        if self.cancel.is_cancelled() {
            return Ok(false);
        }
        match self.tx.try_send(event) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                warn!(session = %self.id, user_id = self.user_id, "outbound queue full, closing session");
                self.close(close_code::BACKPRESSURE, "outbound queue overflow");
                Err(HubError::Backpressure)
            }
            Err(TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// Ask the connection task to close with `code`. The first reason wins.
    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.close.set(CloseReason { code, reason });
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close.get().copied()
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub async fn principal(&self) -> Principal {
        self.principal.read().await.clone()
    }

    pub async fn token_hash(&self) -> String {
        self.token_hash.read().await.clone()
    }

    pub(crate) async fn replace_credentials(&self, principal: Principal, token_hash: String) {
        *self.principal.write().await = principal;
        *self.token_hash.write().await = token_hash;
    }
}

/// Live sessions, indexed by id and by user. "Send to user" resolves the
/// user's sessions at delivery time.
pub struct SessionManager {
    queue_capacity: usize,
    sessions: RwLock<HashMap<SessionId, Arc<SessionHandle>>>,
    by_user: RwLock<HashMap<UserId, HashSet<SessionId>>>,
}

impl SessionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            sessions: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        principal: Principal,
        token_hash: String,
    ) -> (Arc<SessionHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = Arc::new(SessionHandle {
            id: Uuid::new_v4(),
            user_id: principal.user_id,
            tx,
            cancel: CancellationToken::new(),
            close: OnceLock::new(),
            principal: RwLock::new(principal),
            token_hash: RwLock::new(token_hash),
        });

        self.sessions.write().await.insert(handle.id, handle.clone());
        self.by_user
            .write()
            .await
            .entry(handle.user_id)
            .or_default()
            .insert(handle.id);

        debug!(session = %handle.id, user_id = handle.user_id, "session registered");
        (handle, rx)
    }

    /// Remove a session. Returns the handle and how many sessions the user
    /// still has, or `None` if it was already gone.
    pub async fn unregister(&self, session_id: SessionId) -> Option<(Arc<SessionHandle>, usize)> {
        let handle = self.sessions.write().await.remove(&session_id)?;

        let mut by_user = self.by_user.write().await;
        let remaining = match by_user.get_mut(&handle.user_id) {
            Some(ids) => {
                ids.remove(&session_id);
                ids.len()
            }
            None => 0,
        };
        if remaining == 0 {
            by_user.remove(&handle.user_id);
        }

        Some((handle, remaining))
    }

    pub async fn get(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    pub async fn sessions_of(&self, user_id: UserId) -> Vec<Arc<SessionHandle>> {
        let ids: Vec<SessionId> = match self.by_user.read().await.get(&user_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Vec::new(),
        };
        let sessions = self.sessions.read().await;
        ids.iter().filter_map(|id| sessions.get(id).cloned()).collect()
    }

    pub async fn live_count(&self, user_id: UserId) -> usize {
        self.by_user.read().await.get(&user_id).map_or(0, HashSet::len)
    }

    /// Queue an event for one session. A session that is gone or closing is
    /// `NotFound`; a full queue is `Backpressure` and closes the session.
    pub async fn send(&self, session_id: SessionId, event: Outbound) -> HubResult<()> {
        let session = self.get(session_id).await.ok_or(HubError::NotFound("session"))?;
        if session.try_push(event)? {
            Ok(())
        } else {
            Err(HubError::NotFound("session"))
        }
    }

    /// Deliver to every live session of the user. Returns how many queued it.
    pub async fn send_to_user(&self, user_id: UserId, event: Outbound) -> usize {
        self.sessions_of(user_id)
            .await
            .iter()
            .filter(|s| s.push(event.clone()))
            .count()
    }

    /// Close every live session of the user, e.g. after a ban.
    pub async fn close_user(&self, user_id: UserId, code: u16, reason: &'static str) -> usize {
        let sessions = self.sessions_of(user_id).await;
        for session in &sessions {
            session.close(code, reason);
        }
        sessions.len()
    }

    /// Close every live session authenticated with the token whose hash is
    /// `token_hash`.
    pub async fn close_token(&self, token_hash: &str, code: u16, reason: &'static str) -> usize {
        let sessions: Vec<Arc<SessionHandle>> = self.sessions.read().await.values().cloned().collect();
        let mut closed = 0;
        for session in sessions {
            if session.token_hash().await == token_hash {
                session.close(code, reason);
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_types::models::Role;
    use chrono::{Duration, Utc};

    fn principal(user_id: UserId) -> Principal {
        Principal {
            user_id,
            username: format!("user{}", user_id),
            role: Role::User,
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    fn pong() -> Outbound {
        Arc::new(ServerEvent::Pong { timestamp: Utc::now() })
    }

    #[tokio::test]
    async fn full_queue_closes_the_session() {
        let manager = SessionManager::new(2);
        let (handle, mut rx) = manager.register(principal(1), "h".into()).await;

        assert!(handle.push(pong()));
        assert!(handle.push(pong()));
        assert!(matches!(handle.try_push(pong()), Err(HubError::Backpressure)));

        assert!(handle.is_closing());
        assert_eq!(handle.close_reason().unwrap().code, close_code::BACKPRESSURE);

        // Queued events stay readable; nothing more gets in.
        assert!(rx.recv().await.is_some());
        assert!(!handle.push(pong()));
        assert!(matches!(handle.try_push(pong()), Ok(false)));
    }

    #[tokio::test]
    async fn fans_out_to_every_session_of_a_user() {
        let manager = SessionManager::new(8);
        let (_a, mut rx_a) = manager.register(principal(1), "a".into()).await;
        let (b, mut rx_b) = manager.register(principal(1), "b".into()).await;
        let (_c, mut rx_c) = manager.register(principal(2), "c".into()).await;

        assert_eq!(manager.live_count(1).await, 2);
        assert_eq!(manager.send_to_user(1, pong()).await, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());

        let (_, remaining) = manager.unregister(b.id).await.unwrap();
        assert_eq!(remaining, 1);
        assert!(manager.unregister(b.id).await.is_none());
        assert_eq!(manager.send_to_user(1, pong()).await, 1);
        assert!(matches!(manager.send(b.id, pong()).await, Err(HubError::NotFound(_))));
    }

    #[tokio::test]
    async fn send_targets_one_session() {
        let manager = SessionManager::new(1);
        let (a, mut rx_a) = manager.register(principal(1), "a".into()).await;
        let (_b, mut rx_b) = manager.register(principal(1), "b".into()).await;

        manager.send(a.id, pong()).await.unwrap();
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        manager.send(a.id, pong()).await.unwrap();
        assert!(matches!(manager.send(a.id, pong()).await, Err(HubError::Backpressure)));
        assert!(matches!(manager.send(a.id, pong()).await, Err(HubError::NotFound(_))));
    }

    #[tokio::test]
    async fn first_close_reason_wins() {
        let manager = SessionManager::new(4);
        let (handle, _rx) = manager.register(principal(3), "x".into()).await;

        assert_eq!(manager.close_user(3, close_code::FORBIDDEN, "banned").await, 1);
        handle.close(close_code::IDLE_TIMEOUT, "idle");
        assert_eq!(
            handle.close_reason(),
            Some(CloseReason { code: close_code::FORBIDDEN, reason: "banned" })
        );
        handle.closed().await;
    }
}
