use agora_types::models::{Mention, Message, MessageHistoryEntry, MessageStatus};
use agora_types::{ConversationId, MessageId, UserId};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, TransactionBehavior};

use crate::models::{EditOutcome, NewMessage, TombstoneOutcome};
use crate::{Database, OptionalExt, db_time, enum_col, time_col};

const MESSAGE_SELECT: &str = "SELECT m.id, m.conversation_id, m.author_id, COALESCE(u.username, 'unknown'),
        m.content, m.message_type, m.parent_message_id, m.status, m.is_pinned, m.is_edited,
        m.created_at, m.updated_at
     FROM messages m
     LEFT JOIN users u ON u.id = m.author_id";

impl Database {
    // -- Messages --

    /// Insert a message, its mention rows and the conversation's sequence
    /// pointer in one IMMEDIATE transaction. Nothing is visible unless all
    /// of it commits.
    pub fn insert_message(&self, new: &NewMessage<'_>, now: DateTime<Utc>) -> Result<Message> {
        let ts = db_time(now);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            tx.execute(
                "INSERT INTO messages
                    (conversation_id, author_id, content, message_type, parent_message_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                rusqlite::params![
                    new.conversation_id,
                    new.author_id,
                    new.content,
                    new.message_type.as_str(),
                    new.parent_message_id,
                    MessageStatus::Sent.as_str(),
                    &ts
                ],
            )?;
            let id = tx.last_insert_rowid();

            insert_mentions(&tx, id, new.mentions, &ts)?;

            tx.execute(
                "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![new.conversation_id, id, &ts],
            )?;

            let message = query_message(&tx, id)?
                .ok_or_else(|| anyhow!("message {} vanished inside its own transaction", id))?;
            tx.commit()?;
            Ok(message)
        })
    }

    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// Newest first, optionally strictly older than `before`.
    pub fn get_messages(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE m.conversation_id = ?1 AND (?2 IS NULL OR m.id < ?2)
                 ORDER BY m.id DESC
                 LIMIT ?3",
                MESSAGE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, before, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Record the current content in `message_history`, then apply the edit.
    pub fn edit_message(
        &self,
        id: MessageId,
        new_content: &str,
        edited_by: UserId,
        mentions: &[UserId],
        now: DateTime<Utc>,
    ) -> Result<EditOutcome> {
        let ts = db_time(now);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current: Option<(String, String)> = tx
                .query_row(
                    "SELECT content, status FROM messages WHERE id = ?1",
                    [id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((old_content, status)) = current else {
                return Ok(EditOutcome::NotFound);
            };
            if status == MessageStatus::Deleted.as_str() {
                return Ok(EditOutcome::Deleted);
            }

            tx.execute(
                "INSERT INTO message_history (message_id, old_content, edited_by, edited_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id, &old_content, edited_by, &ts],
            )?;
            tx.execute(
                "UPDATE messages SET content = ?2, status = ?3, is_edited = 1, updated_at = ?4 WHERE id = ?1",
                rusqlite::params![id, new_content, MessageStatus::Edited.as_str(), &ts],
            )?;
            let new_mentions = insert_mentions(&tx, id, mentions, &ts)?;

            let message = query_message(&tx, id)?
                .ok_or_else(|| anyhow!("message {} vanished during edit", id))?;
            tx.commit()?;
            Ok(EditOutcome::Edited { message, new_mentions })
        })
    }

    /// Soft delete: the row keeps its id and thread position, content is cleared.
    pub fn tombstone_message(&self, id: MessageId, now: DateTime<Utc>) -> Result<TombstoneOutcome> {
        let ts = db_time(now);
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = tx.execute(
                "UPDATE messages SET status = ?2, content = '', is_pinned = 0, updated_at = ?3
                 WHERE id = ?1 AND status != ?2",
                rusqlite::params![id, MessageStatus::Deleted.as_str(), &ts],
            )?;
            let outcome = match query_message(&tx, id)? {
                None => TombstoneOutcome::NotFound,
                Some(message) if changed == 1 => TombstoneOutcome::Deleted(message),
                Some(message) => TombstoneOutcome::AlreadyDeleted(message),
            };
            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Returns the updated message, or `None` if it is missing or tombstoned.
    pub fn set_pinned(&self, id: MessageId, pinned: bool, now: DateTime<Utc>) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE messages SET is_pinned = ?2, updated_at = ?3 WHERE id = ?1 AND status != ?4",
                rusqlite::params![id, pinned, db_time(now), MessageStatus::Deleted.as_str()],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }

    /// Live pinned messages, newest first.
    pub fn pinned_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let sql = format!(
                "{} WHERE m.conversation_id = ?1 AND m.is_pinned = 1 AND m.status != ?2
                 ORDER BY m.id DESC",
                MESSAGE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![conversation_id, MessageStatus::Deleted.as_str()],
                    message_from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Oldest edit first.
    pub fn message_history(&self, message_id: MessageId) -> Result<Vec<MessageHistoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, old_content, edited_by, edited_at
                 FROM message_history WHERE message_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([message_id], |row| {
                    Ok(MessageHistoryEntry {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        old_content: row.get(2)?,
                        edited_by: row.get(3)?,
                        edited_at: time_col(row, 4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Mentions --

    #[cfg(test)]
    pub fn mentioned_user_ids(&self, message_id: MessageId) -> Result<Vec<UserId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT mentioned_user_id FROM message_mentions WHERE message_id = ?1 ORDER BY mentioned_user_id",
            )?;
            let ids = stmt
                .query_map([message_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Returns false if the user has no mention on that message.
    pub fn mark_mention_read(&self, message_id: MessageId, user_id: UserId) -> Result<bool> {
        self.with_conn(|conn| {
            let matched = conn.execute(
                "UPDATE message_mentions SET is_read = 1 WHERE message_id = ?1 AND mentioned_user_id = ?2",
                rusqlite::params![message_id, user_id],
            )?;
            Ok(matched == 1)
        })
    }

    /// Newest first.
    pub fn mentions_for_user(&self, user_id: UserId, unread_only: bool, limit: u32) -> Result<Vec<Mention>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT mm.message_id, m.conversation_id, m.author_id, mm.mentioned_user_id, mm.is_read, mm.created_at
                 FROM message_mentions mm
                 JOIN messages m ON m.id = mm.message_id
                 WHERE mm.mentioned_user_id = ?1 AND (?2 = 0 OR mm.is_read = 0)
                 ORDER BY mm.message_id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, unread_only, limit], |row| {
                    Ok(Mention {
                        message_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        author_id: row.get(2)?,
                        mentioned_user_id: row.get(3)?,
                        is_read: row.get(4)?,
                        created_at: time_col(row, 5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// Returns the user ids that actually got a new row.
fn insert_mentions(conn: &Connection, message_id: MessageId, mentions: &[UserId], ts: &str) -> Result<Vec<UserId>> {
    let mut inserted = Vec::new();
    for &user_id in mentions {
        let changed = conn.execute(
            "INSERT OR IGNORE INTO message_mentions (message_id, mentioned_user_id, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![message_id, user_id, ts],
        )?;
        if changed == 1 {
            inserted.push(user_id);
        }
    }
    Ok(inserted)
}

fn query_message(conn: &Connection, id: MessageId) -> Result<Option<Message>> {
    let sql = format!("{} WHERE m.id = ?1", MESSAGE_SELECT);
    conn.query_row(&sql, [id], message_from_row).optional()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        content: row.get(4)?,
        message_type: enum_col(row, 5)?,
        parent_message_id: row.get(6)?,
        status: enum_col(row, 7)?,
        is_pinned: row.get(8)?,
        is_edited: row.get(9)?,
        created_at: time_col(row, 10)?,
        updated_at: time_col(row, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewConversation;
    use crate::test_support::db_with_users;
    use agora_types::models::{ConversationKind, MemberRole, MessageType};

    fn setup() -> (Database, ConversationId) {
        let db = db_with_users(&[(1, "alice"), (2, "bob")]);
        let conv = db
            .create_conversation(
                &NewConversation {
                    kind: ConversationKind::PublicRoom,
                    name: Some("lobby"),
                    owner_id: 1,
                    is_public: true,
                    max_members: 50,
                },
                Utc::now(),
            )
            .unwrap();
        db.add_member(conv.id, 2, MemberRole::Member, 50, Utc::now()).unwrap();
        (db, conv.id)
    }

    fn send(db: &Database, conversation_id: ConversationId, content: &str, mentions: &[UserId]) -> Message {
        db.insert_message(
            &NewMessage {
                conversation_id,
                author_id: 1,
                content,
                message_type: MessageType::Text,
                parent_message_id: None,
                mentions,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn insert_writes_message_mentions_and_sequence() {
        let (db, cid) = setup();
        let msg = send(&db, cid, "hello @bob", &[2]);

        assert_eq!(msg.author_username, "alice");
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(db.mentioned_user_ids(msg.id).unwrap(), vec![2]);

        let last: Option<i64> = db
            .with_conn(|c| Ok(c.query_row("SELECT last_message_id FROM conversations WHERE id = ?1", [cid], |r| r.get(0))?))
            .unwrap();
        assert_eq!(last, Some(msg.id));
    }

    #[test]
    fn each_edit_appends_one_history_row() {
        let (db, cid) = setup();
        let msg = send(&db, cid, "v1", &[]);

        db.edit_message(msg.id, "v2", 1, &[], Utc::now()).unwrap();
        let first = db.message_history(msg.id).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].old_content, "v1");

        let outcome = db.edit_message(msg.id, "v3 @bob", 1, &[2], Utc::now()).unwrap();
        let EditOutcome::Edited { message, new_mentions } = outcome else {
            panic!("expected edit");
        };
        assert_eq!(message.content, "v3 @bob");
        assert!(message.is_edited);
        assert_eq!(new_mentions, vec![2]);

        let history = db.message_history(msg.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], first[0]);
        assert_eq!(history[1].old_content, "v2");
    }

    #[test]
    fn tombstone_keeps_row_and_blocks_edits() {
        let (db, cid) = setup();
        let msg = send(&db, cid, "secret", &[]);

        let TombstoneOutcome::Deleted(dead) = db.tombstone_message(msg.id, Utc::now()).unwrap() else {
            panic!("expected tombstone");
        };
        assert_eq!(dead.content, "");
        assert!(dead.is_deleted());

        assert!(matches!(
            db.tombstone_message(msg.id, Utc::now()).unwrap(),
            TombstoneOutcome::AlreadyDeleted(_)
        ));
        assert_eq!(db.edit_message(msg.id, "x", 1, &[], Utc::now()).unwrap(), EditOutcome::Deleted);
        assert_eq!(db.tombstone_message(9999, Utc::now()).unwrap(), TombstoneOutcome::NotFound);
        assert!(db.get_message(msg.id).unwrap().is_some());
    }

    #[test]
    fn history_pages_backwards_by_id() {
        let (db, cid) = setup();
        let ids: Vec<MessageId> = (0..5).map(|i| send(&db, cid, &format!("m{}", i), &[]).id).collect();

        let page = db.get_messages(cid, None, 2).unwrap();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[4], ids[3]]);

        let older = db.get_messages(cid, Some(ids[3]), 10).unwrap();
        assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn mention_read_state() {
        let (db, cid) = setup();
        let msg = send(&db, cid, "hey @bob", &[2]);

        assert_eq!(db.mentions_for_user(2, true, 10).unwrap().len(), 1);
        assert!(db.mark_mention_read(msg.id, 2).unwrap());
        assert!(db.mentions_for_user(2, true, 10).unwrap().is_empty());
        assert!(db.mentions_for_user(2, false, 10).unwrap()[0].is_read);
        assert!(!db.mark_mention_read(msg.id, 1).unwrap());
    }

    #[test]
    fn pinning_skips_tombstones() {
        let (db, cid) = setup();
        let msg = send(&db, cid, "pin me", &[]);
        let other = send(&db, cid, "pin me too", &[]);
        send(&db, cid, "not pinned", &[]);
        assert!(db.set_pinned(msg.id, true, Utc::now()).unwrap().unwrap().is_pinned);
        db.set_pinned(other.id, true, Utc::now()).unwrap();

        let pinned: Vec<MessageId> = db.pinned_messages(cid).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(pinned, vec![other.id, msg.id]);

        db.tombstone_message(msg.id, Utc::now()).unwrap();
        assert!(db.set_pinned(msg.id, true, Utc::now()).unwrap().is_none());
        assert_eq!(db.pinned_messages(cid).unwrap().len(), 1);
    }
}
