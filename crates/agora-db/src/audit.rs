use agora_types::ConversationId;
use agora_types::models::AuditEntry;
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;

use crate::models::NewAuditEntry;
use crate::{Database, db_time, enum_col, time_col};

impl Database {
    // -- Audit log --

    pub fn insert_audit(&self, entry: &NewAuditEntry<'_>, now: DateTime<Utc>) -> Result<i64> {
        let details = serde_json::to_string(entry.details)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (action, actor_id, conversation_id, target_user_id, message_id, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    entry.action.as_str(),
                    entry.actor_id,
                    entry.conversation_id,
                    entry.target_user_id,
                    entry.message_id,
                    &details,
                    db_time(now)
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Newest first. `conversation_id = None` lists every entry, global ones
    /// included.
    pub fn audit_log(
        &self,
        conversation_id: Option<ConversationId>,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action, actor_id, conversation_id, target_user_id, message_id, details, created_at
                 FROM audit_log
                 WHERE (?1 IS NULL OR conversation_id = ?1) AND (?2 IS NULL OR id < ?2)
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, before, limit], audit_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let raw: String = row.get(6)?;
    let details = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(AuditEntry {
        id: row.get(0)?,
        action: enum_col(row, 1)?,
        actor_id: row.get(2)?,
        conversation_id: row.get(3)?,
        target_user_id: row.get(4)?,
        message_id: row.get(5)?,
        details,
        created_at: time_col(row, 7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db_with_users;
    use agora_types::models::AuditAction;
    use serde_json::json;

    fn record(db: &Database, action: AuditAction, conversation_id: Option<ConversationId>) -> i64 {
        db.insert_audit(
            &NewAuditEntry {
                action,
                actor_id: 1,
                conversation_id,
                target_user_id: Some(2),
                message_id: None,
                details: &json!({ "reason": "spam" }),
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn scoped_listing_and_paging() {
        let db = db_with_users(&[(1, "mod"), (2, "noisy")]);
        let a = record(&db, AuditAction::MemberMuted, Some(7));
        record(&db, AuditAction::SanctionApplied, None);
        let c = record(&db, AuditAction::MemberRemoved, Some(7));

        let scoped = db.audit_log(Some(7), None, 10).unwrap();
        assert_eq!(scoped.iter().map(|e| e.id).collect::<Vec<_>>(), vec![c, a]);
        assert_eq!(scoped[0].action, AuditAction::MemberRemoved);
        assert_eq!(scoped[0].details["reason"], "spam");
        assert_eq!(scoped[0].target_user_id, Some(2));

        assert_eq!(db.audit_log(None, None, 10).unwrap().len(), 3);
        let older = db.audit_log(None, Some(c), 1).unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].conversation_id, None);
    }
}
