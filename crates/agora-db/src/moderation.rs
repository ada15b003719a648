use agora_types::models::Sanction;
use agora_types::{SanctionId, UserId};
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

use crate::models::NewSanction;
use crate::{Database, OptionalExt, db_time, enum_col, opt_time_col, time_col};

const SANCTION_COLUMNS: &str =
    "id, user_id, moderator_id, sanction_type, reason, conversation_id, created_at, expires_at, is_active";

impl Database {
    // -- Sanctions --

    pub fn insert_sanction(&self, new: &NewSanction<'_>, now: DateTime<Utc>) -> Result<Sanction> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sanctions
                    (user_id, moderator_id, sanction_type, reason, conversation_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    new.user_id,
                    new.moderator_id,
                    new.sanction_type.as_str(),
                    new.reason,
                    new.conversation_id,
                    db_time(now),
                    new.expires_at.map(db_time)
                ],
            )?;
            let id = conn.last_insert_rowid();
            query_sanction(conn, id)?.ok_or_else(|| anyhow!("sanction {} missing after insert", id))
        })
    }

    pub fn get_sanction(&self, id: SanctionId) -> Result<Option<Sanction>> {
        self.with_conn(|conn| query_sanction(conn, id))
    }

    /// Deactivate a sanction. Returns `None` if it does not exist; lifting an
    /// already inactive sanction returns it unchanged.
    pub fn lift_sanction(&self, id: SanctionId) -> Result<Option<Sanction>> {
        self.with_conn(|conn| {
            conn.execute("UPDATE sanctions SET is_active = 0 WHERE id = ?1", [id])?;
            query_sanction(conn, id)
        })
    }

    /// Sanctions that are active and unexpired at `now`, global and scoped alike.
    pub fn active_sanctions(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<Sanction>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM sanctions
                 WHERE user_id = ?1 AND is_active = 1 AND (expires_at IS NULL OR expires_at > ?2)
                 ORDER BY id",
                SANCTION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, db_time(now)], sanction_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Full sanction record for a user, newest first.
    pub fn sanctions_for_user(&self, user_id: UserId) -> Result<Vec<Sanction>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM sanctions WHERE user_id = ?1 ORDER BY id DESC", SANCTION_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], sanction_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Flip timed-out sanctions to inactive. Returns how many rows changed.
    pub fn expire_sanctions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let expired = conn.execute(
                "UPDATE sanctions SET is_active = 0
                 WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at <= ?1",
                [db_time(now)],
            )?;
            Ok(expired)
        })
    }
}

fn query_sanction(conn: &Connection, id: SanctionId) -> Result<Option<Sanction>> {
    let sql = format!("SELECT {} FROM sanctions WHERE id = ?1", SANCTION_COLUMNS);
    conn.query_row(&sql, [id], sanction_from_row).optional()
}

fn sanction_from_row(row: &Row<'_>) -> rusqlite::Result<Sanction> {
    Ok(Sanction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        moderator_id: row.get(2)?,
        sanction_type: enum_col(row, 3)?,
        reason: row.get(4)?,
        conversation_id: row.get(5)?,
        created_at: time_col(row, 6)?,
        expires_at: opt_time_col(row, 7)?,
        is_active: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db_with_users;
    use agora_types::models::SanctionType;
    use chrono::Duration;

    fn mute(db: &Database, expires_at: Option<DateTime<Utc>>) -> Sanction {
        db.insert_sanction(
            &NewSanction {
                user_id: 2,
                moderator_id: 1,
                sanction_type: SanctionType::Mute,
                reason: "flooding",
                conversation_id: None,
                expires_at,
            },
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn expired_sanctions_are_not_active() {
        let db = db_with_users(&[(1, "mod"), (2, "noisy")]);
        let now = Utc::now();
        let timed = mute(&db, Some(now + Duration::seconds(30)));
        let permanent = mute(&db, None);

        assert_eq!(db.active_sanctions(2, now).unwrap().len(), 2);

        let later = now + Duration::seconds(31);
        let active = db.active_sanctions(2, later).unwrap();
        assert_eq!(active.iter().map(|s| s.id).collect::<Vec<_>>(), vec![permanent.id]);

        assert_eq!(db.expire_sanctions(later).unwrap(), 1);
        assert_eq!(db.expire_sanctions(later).unwrap(), 0);
        assert!(!db.get_sanction(timed.id).unwrap().unwrap().is_active);
    }

    #[test]
    fn lifting_keeps_the_record() {
        let db = db_with_users(&[(1, "mod"), (2, "noisy")]);
        let s = mute(&db, None);

        let lifted = db.lift_sanction(s.id).unwrap().unwrap();
        assert!(!lifted.is_active);
        assert!(db.active_sanctions(2, Utc::now()).unwrap().is_empty());
        assert_eq!(db.sanctions_for_user(2).unwrap().len(), 1);
        assert!(db.lift_sanction(999).unwrap().is_none());
    }
}
