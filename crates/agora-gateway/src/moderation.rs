use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use agora_db::models::NewSanction;
use agora_types::api::ApplySanctionRequest;
use agora_types::events::close_code;
use agora_types::models::{AuditAction, ConversationKind, ConversationMember, Principal, Sanction, SanctionType};
use agora_types::{ConversationId, SanctionId, UserId};

use crate::audit::AuditRecord;
use crate::error::{HubError, HubResult};
use crate::hub::Hub;

const MAX_REASON_CHARS: usize = 500;

/// What a sanction can stand in the way of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeratedAction {
    Connect,
    Join,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanctionVerdict {
    Allowed,
    Denied(String),
}

impl SanctionVerdict {
    pub fn into_result(self) -> HubResult<()> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(reason) => Err(HubError::SanctionDenied(reason)),
        }
    }
}

/// Decide `action` in `conversation_id` (`None` for connection-level checks)
/// against a user's sanctions. Warnings never restrict; a mute blocks
/// posting; a ban blocks everything. Scoped sanctions only count in their
/// own conversation.
pub fn evaluate(
    sanctions: &[Sanction],
    action: ModeratedAction,
    conversation_id: Option<ConversationId>,
    now: DateTime<Utc>,
) -> SanctionVerdict {
    for sanction in sanctions {
        if !sanction.is_effective(now) || !sanction.covers(conversation_id) {
            continue;
        }
        let restricts = match sanction.sanction_type {
            SanctionType::Warn => false,
            SanctionType::Mute => action == ModeratedAction::Post,
            SanctionType::Ban => true,
        };
        if !restricts {
            continue;
        }

        let what = match sanction.sanction_type {
            SanctionType::Mute => "muted",
            _ => "banned",
        };
        let until = match sanction.expires_at {
            Some(at) => format!(" until {}", at.to_rfc3339()),
            None => String::new(),
        };
        return SanctionVerdict::Denied(format!("{}{}: {}", what, until, sanction.reason));
    }
    SanctionVerdict::Allowed
}

impl Hub {
    /// Sanctions plus the identity record's own ban/mute flags.
    pub async fn check_sanctions(
        &self,
        user_id: UserId,
        action: ModeratedAction,
        conversation_id: Option<ConversationId>,
    ) -> HubResult<SanctionVerdict> {
        let now = Utc::now();
        let (user, sanctions) = self
            .store("check_sanctions", move |db| {
                Ok((db.get_user(user_id)?, db.active_sanctions(user_id, now)?))
            })
            .await?;

        if let Some(user) = user {
            if user.is_banned {
                return Ok(SanctionVerdict::Denied("account is banned".into()));
            }
            if user.is_muted && action == ModeratedAction::Post {
                return Ok(SanctionVerdict::Denied("account is muted".into()));
            }
        }
        Ok(evaluate(&sanctions, action, conversation_id, now))
    }

    pub async fn apply_sanction(&self, moderator: &Principal, req: ApplySanctionRequest) -> HubResult<Sanction> {
        if !moderator.role.is_moderator() {
            return Err(HubError::forbidden("moderator role required"));
        }
        if req.sanction_type == SanctionType::Ban && req.duration_secs.is_none() && !moderator.role.is_admin() {
            return Err(HubError::forbidden("permanent bans require an admin"));
        }
        if req.user_id == moderator.user_id {
            return Err(HubError::validation("cannot sanction yourself"));
        }
        let reason = req.reason.trim().to_string();
        if reason.is_empty() {
            return Err(HubError::validation("reason is required"));
        }
        if reason.chars().count() > MAX_REASON_CHARS {
            return Err(HubError::validation(format!("reason exceeds {} characters", MAX_REASON_CHARS)));
        }
        let expires_at = match req.duration_secs {
            Some(secs) if secs <= 0 => return Err(HubError::validation("duration must be positive")),
            Some(secs) => Some(Utc::now() + Duration::seconds(secs)),
            None => None,
        };

        let target_id = req.user_id;
        let target = self
            .store("get_user", move |db| db.get_user(target_id))
            .await?
            .ok_or(HubError::NotFound("user"))?;
        if target.role.is_moderator() && !moderator.role.is_admin() {
            return Err(HubError::forbidden("only admins can sanction moderators"));
        }
        if let Some(conversation_id) = req.conversation_id {
            self.conversation(conversation_id).await?;
        }

        let moderator_id = moderator.user_id;
        let sanction_type = req.sanction_type;
        let conversation_id = req.conversation_id;
        let sanction = self
            .store("insert_sanction", move |db| {
                db.insert_sanction(
                    &NewSanction {
                        user_id: target_id,
                        moderator_id,
                        sanction_type,
                        reason: &reason,
                        conversation_id,
                        expires_at,
                    },
                    Utc::now(),
                )
            })
            .await?;

        info!(
            sanction_id = sanction.id,
            user_id = target_id,
            moderator_id,
            sanction_type = %sanction_type,
            ?conversation_id,
            ?expires_at,
            "sanction applied"
        );

        let mut record = AuditRecord::new(AuditAction::SanctionApplied, moderator_id)
            .target(target_id)
            .details(json!({
                "sanction_id": sanction.id,
                "sanction_type": sanction_type,
                "reason": sanction.reason,
                "expires_at": expires_at,
            }));
        if let Some(conversation_id) = conversation_id {
            record = record.conversation(conversation_id);
        }
        self.audit(record).await;

        if sanction_type == SanctionType::Ban {
            self.enforce_ban(moderator_id, target_id, conversation_id, &sanction.reason)
                .await;
        }
        Ok(sanction)
    }

    /// A global ban drops every live session. A scoped one removes the user
    /// from that conversation; in a direct conversation, where membership is
    /// fixed, it only cuts their subscriptions.
    async fn enforce_ban(
        &self,
        moderator_id: UserId,
        user_id: UserId,
        conversation_id: Option<ConversationId>,
        reason: &str,
    ) {
        match conversation_id {
            None => {
                let closed = self
                    .inner
                    .sessions
                    .close_user(user_id, close_code::FORBIDDEN, "banned")
                    .await;
                if let Err(e) = self
                    .store("deactivate_user_sessions", move |db| db.deactivate_user_sessions(user_id))
                    .await
                {
                    warn!(user_id, "failed to deactivate sessions after ban: {}", e);
                }
                info!(user_id, closed, "closed sessions of banned user");
            }
            Some(conversation_id) => {
                let is_direct = match self.conversation(conversation_id).await {
                    Ok(conversation) => conversation.kind == ConversationKind::DirectMessage,
                    Err(e) => {
                        warn!(user_id, conversation_id, "failed to load conversation for ban: {}", e);
                        false
                    }
                };
                if is_direct {
                    for session in self.inner.sessions.sessions_of(user_id).await {
                        self.inner.registry.unsubscribe(session.id, conversation_id).await;
                    }
                    return;
                }

                let record = AuditRecord::new(AuditAction::MemberRemoved, moderator_id)
                    .conversation(conversation_id)
                    .target(user_id)
                    .details(json!({ "reason": reason }));
                match self.remove_from(conversation_id, user_id, record).await {
                    Ok(removed) => info!(user_id, conversation_id, removed, "banned user removed from conversation"),
                    Err(e) => warn!(user_id, conversation_id, "failed to remove banned member: {}", e),
                }
            }
        }
    }

    /// Only admins may lift a permanent ban, mirroring who may apply one.
    pub async fn lift_sanction(&self, moderator: &Principal, sanction_id: SanctionId) -> HubResult<Sanction> {
        if !moderator.role.is_moderator() {
            return Err(HubError::forbidden("moderator role required"));
        }
        let existing = self
            .store("get_sanction", move |db| db.get_sanction(sanction_id))
            .await?
            .ok_or(HubError::NotFound("sanction"))?;
        if existing.sanction_type == SanctionType::Ban && existing.expires_at.is_none() && !moderator.role.is_admin() {
            return Err(HubError::forbidden("permanent bans require an admin"));
        }

        let sanction = self
            .store("lift_sanction", move |db| db.lift_sanction(sanction_id))
            .await?
            .ok_or(HubError::NotFound("sanction"))?;
        info!(sanction_id, user_id = sanction.user_id, moderator_id = moderator.user_id, "sanction lifted");

        let mut record = AuditRecord::new(AuditAction::SanctionLifted, moderator.user_id)
            .target(sanction.user_id)
            .details(json!({ "sanction_id": sanction.id, "sanction_type": sanction.sanction_type }));
        if let Some(conversation_id) = sanction.conversation_id {
            record = record.conversation(conversation_id);
        }
        self.audit(record).await;
        Ok(sanction)
    }

    /// Moderators see anyone's record; users only their own.
    pub async fn sanctions_for_user(&self, actor: &Principal, user_id: UserId) -> HubResult<Vec<Sanction>> {
        if actor.user_id != user_id && !actor.role.is_moderator() {
            return Err(HubError::forbidden("moderator role required"));
        }
        self.store("sanctions_for_user", move |db| db.sanctions_for_user(user_id))
            .await
    }

    /// Toggle a member's conversation-level mute.
    pub async fn set_member_muted(
        &self,
        actor: &Principal,
        conversation_id: ConversationId,
        user_id: UserId,
        muted: bool,
    ) -> HubResult<ConversationMember> {
        self.conversation(conversation_id).await?;
        if !actor.role.is_moderator() {
            let member = self.active_member(conversation_id, actor.user_id).await?;
            if !member.role.can_moderate() {
                return Err(HubError::forbidden("only owners and moderators can mute members"));
            }
        }

        let updated = self
            .store("set_member_muted", move |db| {
                if !db.set_member_muted(conversation_id, user_id, muted)? {
                    return Ok(None);
                }
                db.get_member(conversation_id, user_id)
            })
            .await?
            .ok_or(HubError::NotFound("member"))?;

        info!(conversation_id, user_id, muted, by = actor.user_id, "member mute changed");
        let action = if muted { AuditAction::MemberMuted } else { AuditAction::MemberUnmuted };
        self.audit(
            AuditRecord::new(action, actor.user_id)
                .conversation(conversation_id)
                .target(user_id),
        )
        .await;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanction(sanction_type: SanctionType, conversation_id: Option<ConversationId>) -> Sanction {
        Sanction {
            id: 1,
            user_id: 2,
            moderator_id: 1,
            sanction_type,
            reason: "spam".into(),
            conversation_id,
            created_at: Utc::now(),
            expires_at: None,
            is_active: true,
        }
    }

    #[test]
    fn warn_never_restricts() {
        let s = [sanction(SanctionType::Warn, None)];
        for action in [ModeratedAction::Connect, ModeratedAction::Join, ModeratedAction::Post] {
            assert_eq!(evaluate(&s, action, Some(1), Utc::now()), SanctionVerdict::Allowed);
        }
    }

    #[test]
    fn mute_blocks_posting_only() {
        let s = [sanction(SanctionType::Mute, None)];
        let now = Utc::now();
        assert!(matches!(evaluate(&s, ModeratedAction::Post, Some(1), now), SanctionVerdict::Denied(_)));
        assert_eq!(evaluate(&s, ModeratedAction::Join, Some(1), now), SanctionVerdict::Allowed);
        assert_eq!(evaluate(&s, ModeratedAction::Connect, None, now), SanctionVerdict::Allowed);
    }

    #[test]
    fn scoped_ban_stays_in_its_conversation() {
        let s = [sanction(SanctionType::Ban, Some(5))];
        let now = Utc::now();
        assert!(matches!(evaluate(&s, ModeratedAction::Join, Some(5), now), SanctionVerdict::Denied(_)));
        assert_eq!(evaluate(&s, ModeratedAction::Post, Some(6), now), SanctionVerdict::Allowed);
        assert_eq!(evaluate(&s, ModeratedAction::Connect, None, now), SanctionVerdict::Allowed);
    }

    #[test]
    fn expired_or_lifted_sanctions_are_ignored() {
        let now = Utc::now();
        let mut expired = sanction(SanctionType::Ban, None);
        expired.expires_at = Some(now - Duration::seconds(1));
        let mut lifted = sanction(SanctionType::Ban, None);
        lifted.is_active = false;

        assert_eq!(
            evaluate(&[expired, lifted], ModeratedAction::Connect, None, now),
            SanctionVerdict::Allowed
        );
    }

    #[test]
    fn denial_mentions_expiry_and_reason() {
        let now = Utc::now();
        let mut s = sanction(SanctionType::Mute, None);
        s.expires_at = Some(now + Duration::minutes(10));
        let SanctionVerdict::Denied(reason) = evaluate(&[s], ModeratedAction::Post, Some(1), now) else {
            panic!("expected denial");
        };
        assert!(reason.starts_with("muted until "));
        assert!(reason.ends_with(": spam"));
        assert!(matches!(
            SanctionVerdict::Denied(reason).into_result(),
            Err(HubError::SanctionDenied(_))
        ));
    }
}
