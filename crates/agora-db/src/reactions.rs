use agora_types::models::Reaction;
use agora_types::{MessageId, UserId};
use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::{Database, db_time, time_col};

impl Database {
    // -- Reactions --

    /// Returns true if a new row was written; false if the triple already existed.
    pub fn add_reaction(
        &self,
        message_id: MessageId,
        user_id: UserId,
        reaction_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO message_reactions (message_id, user_id, reaction_type, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![message_id, user_id, reaction_type, db_time(now)],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn remove_reaction(&self, message_id: MessageId, user_id: UserId, reaction_type: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM message_reactions WHERE message_id = ?1 AND user_id = ?2 AND reaction_type = ?3",
                rusqlite::params![message_id, user_id, reaction_type],
            )?;
            Ok(deleted == 1)
        })
    }

    /// All reactions on the given messages, ordered by message then time.
    pub fn get_reactions_for_messages(&self, message_ids: &[MessageId]) -> Result<Vec<Reaction>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        self.with_conn(|conn| {
            let placeholders = vec!["?"; message_ids.len()].join(",");
            let sql = format!(
                "SELECT message_id, user_id, reaction_type, created_at
                 FROM message_reactions
                 WHERE message_id IN ({})
                 ORDER BY message_id, created_at, user_id",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(message_ids.iter()), |row| {
                    Ok(Reaction {
                        message_id: row.get(0)?,
                        user_id: row.get(1)?,
                        reaction_type: row.get(2)?,
                        created_at: time_col(row, 3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewConversation, NewMessage};
    use crate::test_support::db_with_users;
    use agora_types::models::{ConversationKind, MessageType};

    fn message(db: &Database) -> MessageId {
        let conv = db
            .create_conversation(
                &NewConversation {
                    kind: ConversationKind::PublicRoom,
                    name: Some("general"),
                    owner_id: 1,
                    is_public: true,
                    max_members: 10,
                },
                Utc::now(),
            )
            .unwrap();
        db.insert_message(
            &NewMessage {
                conversation_id: conv.id,
                author_id: 1,
                content: "react to me",
                message_type: MessageType::Text,
                parent_message_id: None,
                mentions: &[],
            },
            Utc::now(),
        )
        .unwrap()
        .id
    }

    #[test]
    fn duplicate_reaction_is_ignored() {
        let db = db_with_users(&[(1, "alice"), (2, "bob")]);
        let mid = message(&db);

        assert!(db.add_reaction(mid, 2, "thumbs_up", Utc::now()).unwrap());
        assert!(!db.add_reaction(mid, 2, "thumbs_up", Utc::now()).unwrap());
        assert!(db.add_reaction(mid, 2, "heart", Utc::now()).unwrap());
        assert!(db.add_reaction(mid, 1, "thumbs_up", Utc::now()).unwrap());

        let all = db.get_reactions_for_messages(&[mid]).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn remove_reports_whether_anything_was_there() {
        let db = db_with_users(&[(1, "alice")]);
        let mid = message(&db);

        assert!(!db.remove_reaction(mid, 1, "heart").unwrap());
        db.add_reaction(mid, 1, "heart", Utc::now()).unwrap();
        assert!(db.remove_reaction(mid, 1, "heart").unwrap());
        assert!(db.get_reactions_for_messages(&[mid]).unwrap().is_empty());
        assert!(db.get_reactions_for_messages(&[]).unwrap().is_empty());
    }
}
