use std::collections::HashSet;

use chrono::Utc;
use serde_json::json;
use tracing::info;

use agora_db::models::{AddMemberOutcome, NewConversation};
use agora_types::events::ServerEvent;
use agora_types::models::{
    AuditAction, Conversation, ConversationKind, ConversationMember, ConversationSummary, MemberRole, Principal,
};
use agora_types::{ConversationId, UserId};

use crate::audit::AuditRecord;
use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::moderation::ModeratedAction;
use crate::registry::CachedMembers;

const MAX_NAME_CHARS: usize = 100;
const MAX_MEMBERS_LIMIT: u32 = 10_000;

impl Hub {
    // -- Membership --

    /// Join a public room, or re-attach to a conversation the caller already
    /// belongs to. Private rooms and groups need an invitation first.
    pub async fn join(&self, actor: &Principal, conversation_id: ConversationId) -> HubResult<()> {
        let conversation = self.conversation(conversation_id).await?;
        if conversation.kind == ConversationKind::DirectMessage {
            return Err(HubError::validation("direct conversations cannot be joined"));
        }
        if conversation.is_archived {
            return Err(HubError::forbidden("conversation is archived"));
        }
        self.check_sanctions(actor.user_id, ModeratedAction::Join, Some(conversation_id))
            .await?
            .into_result()?;

        let is_member = self.membership(conversation_id, actor.user_id).await?.is_some();
        if !is_member && conversation.kind.requires_invite() {
            return Err(HubError::forbidden("an invitation is required to join"));
        }

        let record = AuditRecord::new(AuditAction::MemberJoined, actor.user_id)
            .conversation(conversation_id)
            .target(actor.user_id);
        self.admit(conversation, actor.user_id, MemberRole::Member, record).await
    }

    /// Add `user_id` as an active member (or confirm they already are),
    /// subscribe all their live sessions and announce the join. `record` is
    /// written only when membership actually changed.
    async fn admit(
        &self,
        conversation: Conversation,
        user_id: UserId,
        role: MemberRole,
        record: AuditRecord,
    ) -> HubResult<()> {
        let hub = self.clone();
        self.detached(async move {
            let conversation_id = conversation.id;
            let max_members = conversation.max_members;
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let outcome = hub
                .store("add_member", move |db| {
                    db.add_member(conversation_id, user_id, role, max_members, now)
                })
                .await?;

            match outcome {
                AddMemberOutcome::Full => return Err(HubError::forbidden("conversation is full")),
                AddMemberOutcome::AlreadyMember => {
                    hub.attach_user(user_id, conversation_id).await;
                }
                AddMemberOutcome::Added | AddMemberOutcome::Rejoined => {
                    hub.inner.registry.member_added(conversation_id, user_id).await;
                    hub.attach_user(user_id, conversation_id).await;
                    hub.inner
                        .registry
                        .broadcast(
                            conversation_id,
                            ServerEvent::MemberJoined {
                                conversation_id,
                                user_id,
                                role,
                                timestamp: now,
                            },
                        )
                        .await;
                    info!(conversation_id, user_id, ?outcome, "member joined");
                    hub.audit(record).await;
                }
            }

            hub.notify_user(user_id, ServerEvent::ConversationJoined { conversation })
                .await;
            Ok(())
        })
        .await
    }

    pub async fn leave(&self, actor: &Principal, conversation_id: ConversationId) -> HubResult<()> {
        let conversation = self.conversation(conversation_id).await?;
        if conversation.kind == ConversationKind::DirectMessage {
            return Err(HubError::validation("direct conversations cannot be left"));
        }

        let record = AuditRecord::new(AuditAction::MemberLeft, actor.user_id)
            .conversation(conversation_id)
            .target(actor.user_id);
        if !self.remove_from(conversation_id, actor.user_id, record).await? {
            return Err(HubError::NotFound("membership"));
        }
        Ok(())
    }

    /// End `user_id`'s membership, unsubscribe their sessions and announce
    /// the departure. Returns false if they were not an active member.
    pub(crate) async fn remove_from(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        record: AuditRecord,
    ) -> HubResult<bool> {
        let hub = self.clone();
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let removed = hub
                .store("remove_member", move |db| db.remove_member(conversation_id, user_id, now))
                .await?;
            if !removed {
                return Ok(false);
            }

            hub.inner.registry.member_removed(conversation_id, user_id).await;
            hub.detach_user(user_id, conversation_id).await;
            hub.inner
                .registry
                .broadcast(
                    conversation_id,
                    ServerEvent::MemberLeft {
                        conversation_id,
                        user_id,
                        timestamp: now,
                    },
                )
                .await;
            hub.notify_user(
                user_id,
                ServerEvent::ConversationLeft {
                    conversation_id,
                    timestamp: now,
                },
            )
            .await;
            info!(conversation_id, user_id, by = record.actor_id(), "member left");
            hub.audit(record).await;
            Ok(true)
        })
        .await
    }

    /// Add another user. In private rooms and groups only owners and
    /// moderators may invite; in public rooms any member may.
    pub async fn invite(&self, actor: &Principal, conversation_id: ConversationId, user_id: UserId) -> HubResult<()> {
        if user_id == actor.user_id {
            return Err(HubError::validation("cannot invite yourself"));
        }
        let conversation = self.conversation(conversation_id).await?;
        if conversation.kind == ConversationKind::DirectMessage {
            return Err(HubError::validation("direct conversations cannot take more members"));
        }
        if conversation.is_archived {
            return Err(HubError::forbidden("conversation is archived"));
        }

        let inviter = self.active_member(conversation_id, actor.user_id).await?;
        if conversation.kind.requires_invite() && !inviter.role.can_moderate() {
            return Err(HubError::forbidden("only owners and moderators can invite"));
        }

        self.store("get_user", move |db| db.get_user(user_id))
            .await?
            .ok_or(HubError::NotFound("user"))?;
        self.check_sanctions(user_id, ModeratedAction::Join, Some(conversation_id))
            .await?
            .into_result()?;

        info!(conversation_id, user_id, by = actor.user_id, "invite");
        let record = AuditRecord::new(AuditAction::MemberInvited, actor.user_id)
            .conversation(conversation_id)
            .target(user_id);
        self.admit(conversation, user_id, MemberRole::Member, record).await
    }

    /// Get or lazily create the direct conversation with `user_id`.
    pub async fn open_direct(&self, actor: &Principal, user_id: UserId) -> HubResult<Conversation> {
        if user_id == actor.user_id {
            return Err(HubError::validation("cannot open a direct conversation with yourself"));
        }
        self.store("get_user", move |db| db.get_user(user_id))
            .await?
            .ok_or(HubError::NotFound("user"))?;

        let requester = actor.user_id;
        let (conversation, created) = self
            .store("get_or_create_direct", move |db| {
                db.get_or_create_direct(requester, user_id, Utc::now())
            })
            .await?;

        let participants = if created { vec![requester, user_id] } else { vec![requester] };
        for participant in participants {
            if created {
                self.inner.registry.member_added(conversation.id, participant).await;
            }
            self.attach_user(participant, conversation.id).await;
            self.notify_user(
                participant,
                ServerEvent::ConversationJoined {
                    conversation: conversation.clone(),
                },
            )
            .await;
        }

        if created {
            info!(conversation_id = conversation.id, a = requester, b = user_id, "direct conversation created");
        }
        Ok(conversation)
    }

    pub async fn create_conversation(
        &self,
        actor: &Principal,
        kind: ConversationKind,
        name: Option<String>,
        is_public: bool,
        max_members: Option<u32>,
    ) -> HubResult<Conversation> {
        if kind == ConversationKind::DirectMessage {
            return Err(HubError::validation("use open_direct for direct conversations"));
        }

        let name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        match &name {
            None if kind != ConversationKind::Group => {
                return Err(HubError::validation("rooms need a name"));
            }
            Some(n) if n.chars().count() > MAX_NAME_CHARS => {
                return Err(HubError::validation(format!("name exceeds {} characters", MAX_NAME_CHARS)));
            }
            _ => {}
        }

        let max_members = max_members.unwrap_or(self.inner.config.default_max_members);
        if !(2..=MAX_MEMBERS_LIMIT).contains(&max_members) {
            return Err(HubError::validation(format!(
                "max_members must be between 2 and {}",
                MAX_MEMBERS_LIMIT
            )));
        }
        let is_public = match kind {
            ConversationKind::PublicRoom => true,
            ConversationKind::PrivateRoom => false,
            _ => is_public,
        };

        let owner_id = actor.user_id;
        let conversation = self
            .store("create_conversation", move |db| {
                db.create_conversation(
                    &NewConversation {
                        kind,
                        name: name.as_deref(),
                        owner_id,
                        is_public,
                        max_members,
                    },
                    Utc::now(),
                )
            })
            .await?;

        self.inner.registry.member_added(conversation.id, owner_id).await;
        self.attach_user(owner_id, conversation.id).await;
        self.notify_user(
            owner_id,
            ServerEvent::ConversationJoined {
                conversation: conversation.clone(),
            },
        )
        .await;

        info!(conversation_id = conversation.id, %kind, owner_id, "conversation created");
        self.audit(
            AuditRecord::new(AuditAction::ConversationCreated, owner_id)
                .conversation(conversation.id)
                .details(json!({ "kind": kind, "name": conversation.name })),
        )
        .await;
        Ok(conversation)
    }

    /// Owners and global moderators can archive. Archiving twice is a no-op.
    pub async fn archive(&self, actor: &Principal, conversation_id: ConversationId) -> HubResult<()> {
        let conversation = self.conversation(conversation_id).await?;
        if conversation.owner_id != actor.user_id && !actor.role.is_moderator() {
            return Err(HubError::forbidden("only the owner can archive"));
        }

        let hub = self.clone();
        let archived_by = actor.user_id;
        self.detached(async move {
            let _order = hub.inner.registry.sequence(conversation_id).await;
            let now = Utc::now();
            let archived = hub
                .store("archive_conversation", move |db| db.archive_conversation(conversation_id, now))
                .await?;
            if archived {
                hub.inner
                    .registry
                    .broadcast(
                        conversation_id,
                        ServerEvent::ConversationArchived {
                            conversation_id,
                            archived_by,
                            timestamp: now,
                        },
                    )
                    .await;
                info!(conversation_id, archived_by, "conversation archived");
                hub.audit(AuditRecord::new(AuditAction::ConversationArchived, archived_by).conversation(conversation_id))
                    .await;
            }
            Ok(())
        })
        .await
    }

    /// The caller's active conversations with unread counts, most recently
    /// active first.
    pub async fn conversations(&self, actor: &Principal) -> HubResult<Vec<ConversationSummary>> {
        let user_id = actor.user_id;
        self.store("list_user_conversations", move |db| db.list_user_conversations(user_id))
            .await
    }

    /// Active member list for anyone allowed to read the conversation.
    pub async fn members(&self, actor: &Principal, conversation_id: ConversationId) -> HubResult<Vec<ConversationMember>> {
        let conversation = self.conversation(conversation_id).await?;
        self.ensure_can_read(actor, &conversation).await?;
        self.store("list_active_members", move |db| db.list_active_members(conversation_id))
            .await
    }

    /// Active member ids, served from the registry cache when warm.
    pub async fn members_of(&self, conversation_id: ConversationId) -> HubResult<HashSet<UserId>> {
        let epoch = match self.inner.registry.cached_members(conversation_id).await {
            CachedMembers::Hit(members) => return Ok(members),
            CachedMembers::Miss { epoch } => epoch,
        };
        let ids = self
            .store("active_member_ids", move |db| db.active_member_ids(conversation_id))
            .await?;
        let members: HashSet<UserId> = ids.into_iter().collect();
        self.inner
            .registry
            .fill_members(conversation_id, epoch, members.clone())
            .await;
        Ok(members)
    }

    pub(crate) async fn ensure_member(&self, conversation_id: ConversationId, user_id: UserId) -> HubResult<()> {
        if self.members_of(conversation_id).await?.contains(&user_id) {
            Ok(())
        } else {
            Err(HubError::forbidden("not a member of this conversation"))
        }
    }

    /// A ban scoped to the conversation (or a global one) shuts the user out
    /// of reading and reacting there, not just posting.
    pub(crate) async fn ensure_not_banned_from(&self, user_id: UserId, conversation_id: ConversationId) -> HubResult<()> {
        self.check_sanctions(user_id, ModeratedAction::Join, Some(conversation_id))
            .await?
            .into_result()
    }

    /// Global moderators can read anything; otherwise banned users are
    /// refused, public rooms are readable by everyone and the rest need
    /// membership.
    pub(crate) async fn ensure_can_read(&self, actor: &Principal, conversation: &Conversation) -> HubResult<()> {
        if actor.role.is_moderator() {
            return Ok(());
        }
        self.ensure_not_banned_from(actor.user_id, conversation.id).await?;
        if conversation.kind == ConversationKind::PublicRoom && conversation.is_public {
            return Ok(());
        }
        self.ensure_member(conversation.id, actor.user_id).await
    }

    async fn attach_user(&self, user_id: UserId, conversation_id: ConversationId) {
        for session in self.inner.sessions.sessions_of(user_id).await {
            self.inner.registry.subscribe(&session, conversation_id).await;
        }
    }

    async fn detach_user(&self, user_id: UserId, conversation_id: ConversationId) {
        for session in self.inner.sessions.sessions_of(user_id).await {
            self.inner.registry.unsubscribe(session.id, conversation_id).await;
        }
    }
}
