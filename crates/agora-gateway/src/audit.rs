use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use agora_db::models::NewAuditEntry;
use agora_types::models::{AuditAction, AuditEntry, Principal};
use agora_types::{ConversationId, MessageId, UserId};

use crate::error::{HubError, HubResult};
use crate::hub::Hub;

const MAX_AUDIT_PAGE: u32 = 200;

/// One audit trail entry waiting to be written.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    action: AuditAction,
    actor_id: UserId,
    conversation_id: Option<ConversationId>,
    target_user_id: Option<UserId>,
    message_id: Option<MessageId>,
    details: Value,
}

impl AuditRecord {
    pub fn new(action: AuditAction, actor_id: UserId) -> Self {
        Self {
            action,
            actor_id,
            conversation_id: None,
            target_user_id: None,
            message_id: None,
            details: Value::Object(Default::default()),
        }
    }

    pub fn conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn target(mut self, user_id: UserId) -> Self {
        self.target_user_id = Some(user_id);
        self
    }

    pub fn message(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn actor_id(&self) -> UserId {
        self.actor_id
    }
}

impl Hub {
    // -- Audit trail --

    /// Write an audit entry after the change it describes has committed. A
    /// failed write is logged; the change itself stands.
    pub(crate) async fn audit(&self, record: AuditRecord) {
        let action = record.action;
        let result = self
            .store("insert_audit", move |db| {
                db.insert_audit(
                    &NewAuditEntry {
                        action: record.action,
                        actor_id: record.actor_id,
                        conversation_id: record.conversation_id,
                        target_user_id: record.target_user_id,
                        message_id: record.message_id,
                        details: &record.details,
                    },
                    Utc::now(),
                )
            })
            .await;
        if let Err(e) = result {
            warn!(%action, "failed to record audit entry: {}", e);
        }
    }

    /// Audit entries, newest first. A conversation's trail is open to its
    /// owner and moderators; the full trail only to global moderators.
    pub async fn audit_log(
        &self,
        actor: &Principal,
        conversation_id: Option<ConversationId>,
        before: Option<i64>,
        limit: Option<u32>,
    ) -> HubResult<Vec<AuditEntry>> {
        if !actor.role.is_moderator() {
            let Some(conversation_id) = conversation_id else {
                return Err(HubError::forbidden("moderator role required"));
            };
            self.conversation(conversation_id).await?;
            let member = self.active_member(conversation_id, actor.user_id).await?;
            if !member.role.can_moderate() {
                return Err(HubError::forbidden("only owners and moderators can read the audit log"));
            }
        } else if let Some(conversation_id) = conversation_id {
            self.conversation(conversation_id).await?;
        }

        let limit = limit.unwrap_or(50).clamp(1, MAX_AUDIT_PAGE);
        self.store("audit_log", move |db| db.audit_log(conversation_id, before, limit))
            .await
    }
}
