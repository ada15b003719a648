use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use agora_db::Database;
use agora_types::events::{ClientCommand, ServerEvent, close_code};
use agora_types::models::{Conversation, ConversationMember, Message, Principal};
use agora_types::{ConversationId, MessageId, SessionId, UserId};

use crate::auth::{AuthVerifier, token_hash};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::moderation::{ModeratedAction, SanctionVerdict, evaluate};
use crate::presence::PresenceTracker;
use crate::rate_limit::RateLimiter;
use crate::registry::Registry;
use crate::sessions::{Outbound, SessionHandle, SessionManager};

/// The messaging hub: connection manager, conversation registry, pipeline,
/// moderation and presence behind one cheaply cloneable handle.
#[derive(Clone)]
pub struct Hub {
    pub(crate) inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    pub(crate) config: HubConfig,
    pub(crate) db: Arc<Database>,
    pub(crate) verifier: Arc<dyn AuthVerifier>,
    pub(crate) sessions: SessionManager,
    pub(crate) registry: Registry,
    pub(crate) limiter: RateLimiter,
    pub(crate) presence: PresenceTracker,
}

/// A freshly authenticated session. The caller owns `events` and must send
/// `ready` before anything read from it.
pub struct Connected {
    pub session: Arc<SessionHandle>,
    pub events: mpsc::Receiver<Outbound>,
    pub ready: ServerEvent,
}

impl Hub {
    pub fn new(config: HubConfig, db: Arc<Database>, verifier: Arc<dyn AuthVerifier>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: SessionManager::new(config.outbound_queue),
                registry: Registry::new(),
                limiter: RateLimiter::new(config.rate_limit_messages, config.rate_limit_window),
                presence: PresenceTracker::new(),
                config,
                db,
                verifier,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Verify a bearer token. Used by the gateway handshake and REST middleware.
    pub fn verify(&self, token: &str) -> HubResult<Principal> {
        let principal = self.inner.verifier.verify(token)?;
        if principal.is_expired(Utc::now()) {
            return Err(HubError::Auth("token expired".into()));
        }
        Ok(principal)
    }

    /// Verify a bearer token and refuse one whose session was logged out.
    pub async fn authenticate(&self, token: &str) -> HubResult<Principal> {
        let principal = self.verify(token)?;
        self.ensure_session_live(&token_hash(token)).await?;
        Ok(principal)
    }

    /// A token whose session row was deactivated stays dead even though its
    /// signature and expiry still check out. Unknown tokens are fine.
    async fn ensure_session_live(&self, hash: &str) -> HubResult<()> {
        let hash = hash.to_string();
        let row = self.store("get_session", move |db| db.get_session(&hash)).await?;
        match row {
            Some(row) if !row.is_active => Err(HubError::Auth("session has been logged out".into())),
            _ => Ok(()),
        }
    }

    // -- Connection lifecycle --

    /// Authenticate, record the session, and subscribe it to every
    /// conversation the user is an active member of and not banned from.
    pub async fn connect(&self, token: &str) -> HubResult<Connected> {
        let principal = self.verify(token)?;
        let user_id = principal.user_id;

        let known = self.store("get_user", move |db| db.get_user(user_id)).await?;
        if known.is_none() {
            return Err(HubError::Auth(format!("unknown user {}", user_id)));
        }

        if let SanctionVerdict::Denied(reason) =
            self.check_sanctions(user_id, ModeratedAction::Connect, None).await?
        {
            warn!(user_id, %reason, "connection refused by sanction");
            return Err(HubError::SanctionDenied(reason));
        }

        let hash = token_hash(token);
        self.ensure_session_live(&hash).await?;
        let expires_at = principal.expires_at;
        let row_hash = hash.clone();
        self.store("upsert_session", move |db| {
            db.upsert_session(user_id, &row_hash, expires_at, Utc::now())
        })
        .await?;

        let now = Utc::now();
        let (mut conversation_ids, sanctions) = self
            .store("user_conversation_ids", move |db| {
                Ok((db.user_conversation_ids(user_id)?, db.active_sanctions(user_id, now)?))
            })
            .await?;
        conversation_ids.retain(|&cid| {
            evaluate(&sanctions, ModeratedAction::Join, Some(cid), now) == SanctionVerdict::Allowed
        });

        let username = principal.username.clone();
        let (session, events) = self.inner.sessions.register(principal, hash).await;
        for &conversation_id in &conversation_ids {
            self.inner.registry.subscribe(&session, conversation_id).await;
        }
        self.inner.registry.track_user(user_id, &conversation_ids).await;
        self.presence_session_opened(user_id).await;

        info!(
            session = %session.id,
            user_id,
            %username,
            conversations = conversation_ids.len(),
            "session connected"
        );

        let ready = ServerEvent::Ready {
            session_id: session.id,
            user_id,
            username,
            conversation_ids,
        };
        Ok(Connected { session, events, ready })
    }

    /// Tear down a session. Safe to call more than once.
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some((session, remaining)) = self.inner.sessions.unregister(session_id).await else {
            return;
        };
        let subscriptions = self.inner.registry.unsubscribe_all(session_id).await;

        let hash = session.token_hash().await;
        if let Err(e) = self
            .store("touch_session", move |db| db.touch_session(&hash, Utc::now()))
            .await
        {
            warn!(session = %session_id, "failed to record session activity: {}", e);
        }

        self.presence_session_closed(session.user_id).await;
        info!(
            session = %session_id,
            user_id = session.user_id,
            subscriptions,
            remaining,
            "session disconnected"
        );
    }

    /// Swap in a new token for the same user.
    pub async fn refresh_token(&self, session: &SessionHandle, token: &str) -> HubResult<()> {
        let principal = self.verify(token)?;
        if principal.user_id != session.user_id {
            return Err(HubError::Auth("token belongs to a different user".into()));
        }

        let hash = token_hash(token);
        self.ensure_session_live(&hash).await?;
        let user_id = principal.user_id;
        let expires_at = principal.expires_at;
        let row_hash = hash.clone();
        self.store("upsert_session", move |db| {
            db.upsert_session(user_id, &row_hash, expires_at, Utc::now())
        })
        .await?;

        session.replace_credentials(principal, hash).await;
        debug!(session = %session.id, user_id, %expires_at, "token refreshed");
        Ok(())
    }

    /// Deactivate the session's token and close every connection using it.
    /// Returns how many connections were closed.
    pub async fn logout(&self, session: &SessionHandle) -> HubResult<usize> {
        let hash = session.token_hash().await;
        let row_hash = hash.clone();
        self.store("deactivate_session", move |db| db.deactivate_session(&row_hash))
            .await?;
        let closed = self
            .inner
            .sessions
            .close_token(&hash, close_code::UNAUTHORIZED, "logged out")
            .await;
        info!(session = %session.id, user_id = session.user_id, closed, "logged out");
        Ok(closed)
    }

    // -- Command dispatch --

    /// Run one client command. `Ok(Some(_))` is a direct reply for the
    /// issuing session; everything else is delivered through fan-out.
    pub async fn dispatch(&self, session: &SessionHandle, cmd: ClientCommand) -> HubResult<Option<ServerEvent>> {
        if let ClientCommand::RefreshToken { token } = &cmd {
            self.refresh_token(session, token).await?;
            return Ok(None);
        }

        let principal = session.principal().await;
        if principal.is_expired(Utc::now()) {
            session.close(close_code::UNAUTHORIZED, "token expired");
            return Err(HubError::Auth("token expired".into()));
        }
        let actor = &principal;

        match cmd {
            ClientCommand::Join { conversation_id } => self.join(actor, conversation_id).await.map(|_| None),
            ClientCommand::Leave { conversation_id } => self.leave(actor, conversation_id).await.map(|_| None),
            ClientCommand::Send {
                conversation_id,
                content,
                parent_message_id,
            } => self
                .send_message(actor, conversation_id, content, parent_message_id)
                .await
                .map(|_| None),
            ClientCommand::Edit { message_id, content } => {
                self.edit_message(actor, message_id, content).await.map(|_| None)
            }
            ClientCommand::Delete { message_id } => self.delete_message(actor, message_id).await.map(|_| None),
            ClientCommand::React {
                message_id,
                reaction_type,
            } => self.react(actor, message_id, reaction_type).await.map(|_| None),
            ClientCommand::Unreact {
                message_id,
                reaction_type,
            } => self.unreact(actor, message_id, reaction_type).await.map(|_| None),
            ClientCommand::MarkRead {
                conversation_id,
                up_to_message_id,
            } => self
                .mark_read(actor, conversation_id, up_to_message_id)
                .await
                .map(|_| None),
            ClientCommand::MarkMentionRead { message_id } => {
                self.mark_mention_read(actor, message_id).await.map(|_| None)
            }
            ClientCommand::OpenDirect { user_id } => self.open_direct(actor, user_id).await.map(|_| None),
            ClientCommand::CreateConversation {
                kind,
                name,
                is_public,
                max_members,
            } => self
                .create_conversation(actor, kind, name, is_public, max_members)
                .await
                .map(|_| None),
            ClientCommand::Invite {
                conversation_id,
                user_id,
            } => self.invite(actor, conversation_id, user_id).await.map(|_| None),
            ClientCommand::Pin { message_id, pinned } => {
                self.set_pinned(actor, message_id, pinned).await.map(|_| None)
            }
            ClientCommand::Archive { conversation_id } => self.archive(actor, conversation_id).await.map(|_| None),
            ClientCommand::Logout => self.logout(session).await.map(|_| None),
            // Handled above, before the expiry check.
            ClientCommand::RefreshToken { .. } => Ok(None),
            ClientCommand::Ping => Ok(Some(ServerEvent::Pong { timestamp: Utc::now() })),
        }
    }

    // -- Store access --

    /// Run a store call on the blocking pool. Failures are retried with
    /// exponential backoff; every store write is a single transaction, so a
    /// failed attempt left nothing behind.
    pub(crate) async fn store<T, F>(&self, op: &'static str, f: F) -> HubResult<T>
    where
        F: Fn(&Database) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt: u32 = 0;
        loop {
            let db = self.inner.db.clone();
            let call = f.clone();
            let err = match tokio::task::spawn_blocking(move || call(&db)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(join) => anyhow::anyhow!("store task failed: {}", join),
            };

            if attempt >= self.inner.config.persist_retries {
                error!(op, attempts = attempt + 1, "store operation failed: {:#}", err);
                return Err(HubError::persistence(err));
            }
            let delay = self.inner.config.persist_backoff * 2u32.saturating_pow(attempt);
            warn!(op, attempt = attempt + 1, ?delay, "store operation failed, retrying: {:#}", err);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run a commit-and-fan-out on its own task. Dropping the caller (a
    /// disconnecting session) does not cancel it.
    pub(crate) async fn detached<T, Fut>(&self, fut: Fut) -> HubResult<T>
    where
        Fut: Future<Output = HubResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(fut)
            .await
            .map_err(|e| HubError::Persistence(format!("commit task failed: {}", e)))?
    }

    // -- Lookups shared by the operation modules --

    pub(crate) async fn conversation(&self, conversation_id: ConversationId) -> HubResult<Conversation> {
        self.store("get_conversation", move |db| db.get_conversation(conversation_id))
            .await?
            .ok_or(HubError::NotFound("conversation"))
    }

    pub(crate) async fn message(&self, message_id: MessageId) -> HubResult<Message> {
        self.store("get_message", move |db| db.get_message(message_id))
            .await?
            .ok_or(HubError::NotFound("message"))
    }

    /// Membership row, if active.
    pub(crate) async fn membership(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> HubResult<Option<ConversationMember>> {
        let member = self
            .store("get_member", move |db| db.get_member(conversation_id, user_id))
            .await?;
        Ok(member.filter(ConversationMember::is_active))
    }

    pub(crate) async fn active_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> HubResult<ConversationMember> {
        self.membership(conversation_id, user_id)
            .await?
            .ok_or_else(|| HubError::forbidden("not a member of this conversation"))
    }

    /// Queue an event on every live session of a user.
    pub(crate) async fn notify_user(&self, user_id: UserId, event: ServerEvent) -> usize {
        self.inner.sessions.send_to_user(user_id, Arc::new(event)).await
    }
}
