use agora_types::{ConversationId, MessageId, UserId};
use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::{Database, OptionalExt, db_time};

impl Database {
    // -- Read receipts --

    /// Move the user's read pointer forward. Returns false when `message_id`
    /// is not past the stored pointer; the pointer never moves back.
    pub fn advance_read_pointer(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO read_receipts (conversation_id, user_id, last_read_message_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE
                    SET last_read_message_id = excluded.last_read_message_id,
                        updated_at = excluded.updated_at
                    WHERE excluded.last_read_message_id > read_receipts.last_read_message_id",
                rusqlite::params![conversation_id, user_id, message_id, db_time(now)],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn last_read(&self, conversation_id: ConversationId, user_id: UserId) -> Result<Option<MessageId>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_read_message_id FROM read_receipts WHERE conversation_id = ?1 AND user_id = ?2",
                rusqlite::params![conversation_id, user_id],
                |row| row.get(0),
            )
            .optional()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewConversation;
    use crate::test_support::db_with_users;
    use agora_types::models::ConversationKind;

    #[test]
    fn pointer_is_monotonic() {
        let db = db_with_users(&[(1, "alice")]);
        let conv = db
            .create_conversation(
                &NewConversation {
                    kind: ConversationKind::Group,
                    name: Some("crew"),
                    owner_id: 1,
                    is_public: false,
                    max_members: 8,
                },
                Utc::now(),
            )
            .unwrap();

        assert_eq!(db.last_read(conv.id, 1).unwrap(), None);
        assert!(db.advance_read_pointer(conv.id, 1, 10, Utc::now()).unwrap());
        assert!(!db.advance_read_pointer(conv.id, 1, 7, Utc::now()).unwrap());
        assert!(!db.advance_read_pointer(conv.id, 1, 10, Utc::now()).unwrap());
        assert_eq!(db.last_read(conv.id, 1).unwrap(), Some(10));
        assert!(db.advance_read_pointer(conv.id, 1, 12, Utc::now()).unwrap());
        assert_eq!(db.last_read(conv.id, 1).unwrap(), Some(12));
    }
}
