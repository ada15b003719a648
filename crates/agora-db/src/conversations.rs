use agora_types::models::{
    Conversation, ConversationKind, ConversationMember, ConversationSummary, MemberRole, MessageStatus,
};
use agora_types::{ConversationId, UserId};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, TransactionBehavior};

use crate::models::{AddMemberOutcome, NewConversation};
use crate::{Database, OptionalExt, db_time, enum_col, opt_time_col, time_col};

const CONVERSATION_COLUMNS: &str =
    "id, kind, name, owner_id, is_public, is_archived, max_members, created_at, updated_at";

const MEMBER_COLUMNS: &str = "cm.conversation_id, cm.user_id, COALESCE(u.username, 'unknown'), \
     cm.role, cm.joined_at, cm.left_at, cm.is_muted";

impl Database {
    // -- Conversations --

    /// Create a room or group with its creator as owner.
    pub fn create_conversation(&self, new: &NewConversation<'_>, now: DateTime<Utc>) -> Result<Conversation> {
        let ts = db_time(now);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO conversations (kind, name, owner_id, is_public, max_members, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![
                    new.kind.as_str(),
                    new.name,
                    new.owner_id,
                    new.is_public,
                    new.max_members,
                    &ts
                ],
            )?;
            let id = tx.last_insert_rowid();
            insert_member(&tx, id, new.owner_id, MemberRole::Owner, &ts)?;
            let conversation = query_conversation(&tx, id)?
                .ok_or_else(|| anyhow!("conversation {} vanished inside its own transaction", id))?;
            tx.commit()?;
            Ok(conversation)
        })
    }

    /// Get the direct-message conversation for exactly this pair, creating it
    /// on first use. Returns `(conversation, created)`.
    pub fn get_or_create_direct(&self, a: UserId, b: UserId, now: DateTime<Utc>) -> Result<(Conversation, bool)> {
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        let dm_key = format!("{}:{}", low, high);
        let ts = db_time(now);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conversations
                    (kind, owner_id, is_public, max_members, dm_key, created_at, updated_at)
                 VALUES (?1, ?2, 0, 2, ?3, ?4, ?4)",
                rusqlite::params![ConversationKind::DirectMessage.as_str(), a, &dm_key, &ts],
            )?;

            let id: ConversationId = tx.query_row(
                "SELECT id FROM conversations WHERE dm_key = ?1",
                [&dm_key],
                |row| row.get(0),
            )?;

            if inserted == 1 {
                insert_member(&tx, id, low, MemberRole::Member, &ts)?;
                insert_member(&tx, id, high, MemberRole::Member, &ts)?;
            }

            let conversation = query_conversation(&tx, id)?
                .ok_or_else(|| anyhow!("direct conversation {} missing", id))?;
            tx.commit()?;
            Ok((conversation, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Returns false if the conversation was missing or already archived.
    pub fn archive_conversation(&self, id: ConversationId, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET is_archived = 1, updated_at = ?2
                 WHERE id = ?1 AND is_archived = 0",
                rusqlite::params![id, db_time(now)],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Members --

    /// Add or reactivate a membership. The capacity check runs in the same
    /// transaction as the insert so two concurrent joins cannot overshoot.
    /// A reactivated row keeps its role and its conversation mute.
    pub fn add_member(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        role: MemberRole,
        max_members: u32,
        now: DateTime<Utc>,
    ) -> Result<AddMemberOutcome> {
        let ts = db_time(now);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT left_at FROM conversation_members WHERE conversation_id = ?1 AND user_id = ?2",
                    rusqlite::params![conversation_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(None) = existing {
                return Ok(AddMemberOutcome::AlreadyMember);
            }

            let active: u32 = tx.query_row(
                "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = ?1 AND left_at IS NULL",
                [conversation_id],
                |row| row.get(0),
            )?;
            if active >= max_members {
                return Ok(AddMemberOutcome::Full);
            }

            let outcome = if existing.is_some() {
                tx.execute(
                    "UPDATE conversation_members SET left_at = NULL, joined_at = ?3
                     WHERE conversation_id = ?1 AND user_id = ?2",
                    rusqlite::params![conversation_id, user_id, &ts],
                )?;
                AddMemberOutcome::Rejoined
            } else {
                insert_member(&tx, conversation_id, user_id, role, &ts)?;
                AddMemberOutcome::Added
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Soft leave. Returns false if there was no active membership.
    pub fn remove_member(&self, conversation_id: ConversationId, user_id: UserId, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversation_members SET left_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                rusqlite::params![conversation_id, user_id, db_time(now)],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn set_member_muted(&self, conversation_id: ConversationId, user_id: UserId, muted: bool) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversation_members SET is_muted = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
                rusqlite::params![conversation_id, user_id, muted],
            )?;
            Ok(changed == 1)
        })
    }

    /// Membership row for the pair, active or not.
    pub fn get_member(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Option<ConversationMember>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM conversation_members cm
                 LEFT JOIN users u ON u.id = cm.user_id
                 WHERE cm.conversation_id = ?1 AND cm.user_id = ?2",
                MEMBER_COLUMNS
            );
            conn.query_row(&sql, rusqlite::params![conversation_id, user_id], member_from_row)
                .optional()
        })
    }

    pub fn list_active_members(&self, conversation_id: ConversationId) -> Result<Vec<ConversationMember>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM conversation_members cm
                 LEFT JOIN users u ON u.id = cm.user_id
                 WHERE cm.conversation_id = ?1 AND cm.left_at IS NULL
                 ORDER BY cm.joined_at, cm.user_id",
                MEMBER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([conversation_id], member_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn active_member_ids(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM conversation_members
                 WHERE conversation_id = ?1 AND left_at IS NULL",
            )?;
            let ids = stmt
                .query_map([conversation_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Conversations the user is currently an active member of.
    pub fn user_conversation_ids(&self, user_id: UserId) -> Result<Vec<ConversationId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id FROM conversation_members
                 WHERE user_id = ?1 AND left_at IS NULL
                 ORDER BY conversation_id",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// The user's active conversations with their read state, most recently
    /// active first.
    pub fn list_user_conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.name, c.owner_id, c.is_public, c.is_archived, c.max_members,
                        c.created_at, c.updated_at,
                        cm.role, c.last_message_id, rr.last_read_message_id,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.id > COALESCE(rr.last_read_message_id, 0)
                            AND m.author_id != cm.user_id
                            AND m.status != ?2)
                 FROM conversation_members cm
                 JOIN conversations c ON c.id = cm.conversation_id
                 LEFT JOIN read_receipts rr
                        ON rr.conversation_id = c.id AND rr.user_id = cm.user_id
                 WHERE cm.user_id = ?1 AND cm.left_at IS NULL
                 ORDER BY COALESCE(c.last_message_id, 0) DESC, c.id DESC",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, MessageStatus::Deleted.as_str()], |row| {
                    Ok(ConversationSummary {
                        conversation: conversation_from_row(row)?,
                        role: enum_col(row, 9)?,
                        last_message_id: row.get(10)?,
                        last_read_message_id: row.get(11)?,
                        unread_count: row.get(12)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Resolve usernames to ids among the conversation's active members.
    pub fn resolve_member_usernames(
        &self,
        conversation_id: ConversationId,
        usernames: &[String],
    ) -> Result<Vec<(UserId, String)>> {
        if usernames.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> = (2..=usernames.len() + 1).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT u.id, u.username FROM users u
                 JOIN conversation_members cm ON cm.user_id = u.id
                 WHERE cm.conversation_id = ?1 AND cm.left_at IS NULL
                   AND u.username IN ({})",
                placeholders.join(", ")
            );

            let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(usernames.len() + 1);
            params.push(&conversation_id);
            for name in usernames {
                params.push(name);
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn insert_member(
    conn: &Connection,
    conversation_id: ConversationId,
    user_id: UserId,
    role: MemberRole,
    ts: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO conversation_members (conversation_id, user_id, role, joined_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![conversation_id, user_id, role.as_str(), ts],
    )?;
    Ok(())
}

fn query_conversation(conn: &Connection, id: ConversationId) -> Result<Option<Conversation>> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    conn.query_row(&sql, [id], conversation_from_row).optional()
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        kind: enum_col(row, 1)?,
        name: row.get(2)?,
        owner_id: row.get(3)?,
        is_public: row.get(4)?,
        is_archived: row.get(5)?,
        max_members: row.get(6)?,
        created_at: time_col(row, 7)?,
        updated_at: time_col(row, 8)?,
    })
}

fn member_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationMember> {
    Ok(ConversationMember {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        username: row.get(2)?,
        role: enum_col(row, 3)?,
        joined_at: time_col(row, 4)?,
        left_at: opt_time_col(row, 5)?,
        is_muted: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db_with_users;

    fn room(db: &Database, owner: UserId, kind: ConversationKind, max_members: u32) -> Conversation {
        db.create_conversation(
            &NewConversation {
                kind,
                name: Some("general"),
                owner_id: owner,
                is_public: kind == ConversationKind::PublicRoom,
                max_members,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn creator_becomes_owner() {
        let db = db_with_users(&[(1, "alice")]);
        let conv = room(&db, 1, ConversationKind::PublicRoom, 10);

        let member = db.get_member(conv.id, 1).unwrap().unwrap();
        assert_eq!(member.role, MemberRole::Owner);
        assert_eq!(member.username, "alice");
        assert!(member.is_active());
    }

    #[test]
    fn direct_conversation_is_idempotent_for_either_order() {
        let db = db_with_users(&[(1, "alice"), (2, "bob")]);
        let (first, created) = db.get_or_create_direct(1, 2, Utc::now()).unwrap();
        assert!(created);
        let (second, created_again) = db.get_or_create_direct(2, 1, Utc::now()).unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(first.kind, ConversationKind::DirectMessage);

        let mut members = db.active_member_ids(first.id).unwrap();
        members.sort();
        assert_eq!(members, vec![1, 2]);
    }

    #[test]
    fn capacity_is_enforced_and_rejoin_reactivates_row() {
        let db = db_with_users(&[(1, "alice"), (2, "bob"), (3, "carol")]);
        let conv = room(&db, 1, ConversationKind::PublicRoom, 2);
        let now = Utc::now();

        assert_eq!(db.add_member(conv.id, 2, MemberRole::Member, 2, now).unwrap(), AddMemberOutcome::Added);
        assert_eq!(db.add_member(conv.id, 2, MemberRole::Member, 2, now).unwrap(), AddMemberOutcome::AlreadyMember);
        assert_eq!(db.add_member(conv.id, 3, MemberRole::Member, 2, now).unwrap(), AddMemberOutcome::Full);

        assert!(db.remove_member(conv.id, 2, now).unwrap());
        assert!(!db.remove_member(conv.id, 2, now).unwrap());
        assert!(!db.get_member(conv.id, 2).unwrap().unwrap().is_active());

        assert_eq!(db.add_member(conv.id, 3, MemberRole::Member, 2, now).unwrap(), AddMemberOutcome::Added);
        assert!(db.remove_member(conv.id, 3, now).unwrap());
        assert_eq!(db.add_member(conv.id, 2, MemberRole::Member, 2, now).unwrap(), AddMemberOutcome::Rejoined);

        // Still exactly one row per pair
        let rows: i64 = db
            .with_conn(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM conversation_members WHERE conversation_id = ?1 AND user_id = 2",
                    [conv.id],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn rejoin_keeps_mute_and_role() {
        let db = db_with_users(&[(1, "alice"), (2, "bob")]);
        let conv = room(&db, 1, ConversationKind::PublicRoom, 10);
        let now = Utc::now();
        db.add_member(conv.id, 2, MemberRole::Moderator, 10, now).unwrap();
        assert!(db.set_member_muted(conv.id, 2, true).unwrap());

        db.remove_member(conv.id, 2, now).unwrap();
        assert_eq!(db.add_member(conv.id, 2, MemberRole::Member, 10, now).unwrap(), AddMemberOutcome::Rejoined);

        let member = db.get_member(conv.id, 2).unwrap().unwrap();
        assert!(member.is_active());
        assert!(member.is_muted);
        assert_eq!(member.role, MemberRole::Moderator);
    }

    #[test]
    fn conversation_list_counts_unread_from_others() {
        let db = db_with_users(&[(1, "alice"), (2, "bob")]);
        let lobby = room(&db, 1, ConversationKind::PublicRoom, 10);
        let quiet = room(&db, 1, ConversationKind::Group, 10);
        db.add_member(lobby.id, 2, MemberRole::Member, 10, Utc::now()).unwrap();

        let mut ids = Vec::new();
        for (author, text) in [(1, "one"), (2, "mine"), (1, "three")] {
            let id = db.with_conn(|c| {
                c.execute(
                    "INSERT INTO messages (conversation_id, author_id, content, created_at, updated_at)
                     VALUES (?1, ?2, ?3, '2026-01-01 00:00:00', '2026-01-01 00:00:00')",
                    rusqlite::params![lobby.id, author, text],
                )?;
                let id = c.last_insert_rowid();
                c.execute("UPDATE conversations SET last_message_id = ?2 WHERE id = ?1", [lobby.id, id])?;
                Ok(id)
            });
            ids.push(id.unwrap());
        }
        db.advance_read_pointer(lobby.id, 2, ids[0], Utc::now()).unwrap();

        let bobs = db.list_user_conversations(2).unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].conversation.id, lobby.id);
        assert_eq!(bobs[0].role, MemberRole::Member);
        assert_eq!(bobs[0].last_message_id, Some(ids[2]));
        assert_eq!(bobs[0].last_read_message_id, Some(ids[0]));
        assert_eq!(bobs[0].unread_count, 1);

        let alices: Vec<ConversationId> = db.list_user_conversations(1).unwrap().iter().map(|s| s.conversation.id).collect();
        assert_eq!(alices, vec![lobby.id, quiet.id]);
    }

    #[test]
    fn usernames_resolve_only_to_active_members() {
        let db = db_with_users(&[(1, "alice"), (2, "bob"), (3, "carol")]);
        let conv = room(&db, 1, ConversationKind::PublicRoom, 10);
        db.add_member(conv.id, 2, MemberRole::Member, 10, Utc::now()).unwrap();

        let names = vec!["bob".to_string(), "carol".to_string(), "ghost".to_string()];
        let resolved = db.resolve_member_usernames(conv.id, &names).unwrap();
        assert_eq!(resolved, vec![(2, "bob".to_string())]);
    }

    #[test]
    fn archive_only_once() {
        let db = db_with_users(&[(1, "alice")]);
        let conv = room(&db, 1, ConversationKind::Group, 5);
        assert!(db.archive_conversation(conv.id, Utc::now()).unwrap());
        assert!(!db.archive_conversation(conv.id, Utc::now()).unwrap());
        assert!(db.get_conversation(conv.id).unwrap().unwrap().is_archived);
    }
}
