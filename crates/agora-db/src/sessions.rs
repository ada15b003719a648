use agora_types::UserId;
use agora_types::models::UserSession;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};

use crate::{Database, OptionalExt, db_time, time_col};

const SESSION_COLUMNS: &str = "id, user_id, session_token, created_at, last_activity, expires_at, is_active";

impl Database {
    // -- User sessions --

    /// Record an authenticated connection. `token_hash` is the SHA-256 of the
    /// bearer token; reconnecting with the same token reuses the row. A row
    /// that was deactivated (logout, ban, expiry) stays inactive.
    pub fn upsert_session(
        &self,
        user_id: UserId,
        token_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UserSession> {
        self.with_conn(|conn| {
            let ts = db_time(now);
            conn.execute(
                "INSERT INTO user_sessions (user_id, session_token, created_at, last_activity, expires_at)
                 VALUES (?1, ?2, ?3, ?3, ?4)
                 ON CONFLICT(session_token) DO UPDATE
                    SET last_activity = excluded.last_activity,
                        expires_at = excluded.expires_at",
                rusqlite::params![user_id, token_hash, &ts, db_time(expires_at)],
            )?;
            query_session(conn, token_hash)?
                .ok_or_else(|| anyhow!("session row missing after upsert"))
        })
    }

    pub fn get_session(&self, token_hash: &str) -> Result<Option<UserSession>> {
        self.with_conn(|conn| query_session(conn, token_hash))
    }

    pub fn touch_session(&self, token_hash: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE user_sessions SET last_activity = ?2 WHERE session_token = ?1 AND is_active = 1",
                rusqlite::params![token_hash, db_time(now)],
            )?;
            Ok(())
        })
    }

    pub fn deactivate_session(&self, token_hash: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE user_sessions SET is_active = 0 WHERE session_token = ?1 AND is_active = 1",
                [token_hash],
            )?;
            Ok(changed == 1)
        })
    }

    /// Deactivate every session of a user, e.g. after a ban.
    pub fn deactivate_user_sessions(&self, user_id: UserId) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE user_sessions SET is_active = 0 WHERE user_id = ?1 AND is_active = 1",
                [user_id],
            )?;
            Ok(changed)
        })
    }

    pub fn expire_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let expired = conn.execute(
                "UPDATE user_sessions SET is_active = 0 WHERE is_active = 1 AND expires_at <= ?1",
                [db_time(now)],
            )?;
            Ok(expired)
        })
    }
}

fn query_session(conn: &Connection, token_hash: &str) -> Result<Option<UserSession>> {
    let sql = format!("SELECT {} FROM user_sessions WHERE session_token = ?1", SESSION_COLUMNS);
    conn.query_row(&sql, [token_hash], session_from_row).optional()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<UserSession> {
    Ok(UserSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        session_token: row.get(2)?,
        created_at: time_col(row, 3)?,
        last_activity: time_col(row, 4)?,
        expires_at: time_col(row, 5)?,
        is_active: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::db_with_users;
    use chrono::Duration;

    #[test]
    fn reconnect_reuses_row_and_expiry_deactivates() {
        let db = db_with_users(&[(1, "alice")]);
        let now = Utc::now();

        let first = db.upsert_session(1, "abc123", now + Duration::minutes(5), now).unwrap();
        let again = db
            .upsert_session(1, "abc123", now + Duration::minutes(10), now + Duration::seconds(1))
            .unwrap();
        assert_eq!(first.id, again.id);
        assert!(again.expires_at > first.expires_at);

        assert_eq!(db.expire_sessions(now + Duration::minutes(6)).unwrap(), 0);
        assert_eq!(db.expire_sessions(now + Duration::minutes(11)).unwrap(), 1);
        assert!(!db.get_session("abc123").unwrap().unwrap().is_active);
    }

    #[test]
    fn deactivate_all_for_user() {
        let db = db_with_users(&[(1, "alice")]);
        let now = Utc::now();
        db.upsert_session(1, "t1", now + Duration::hours(1), now).unwrap();
        db.upsert_session(1, "t2", now + Duration::hours(1), now).unwrap();

        assert_eq!(db.deactivate_user_sessions(1).unwrap(), 2);
        assert!(!db.deactivate_session("t1").unwrap());
    }

    #[test]
    fn logged_out_row_is_not_revived() {
        let db = db_with_users(&[(1, "alice")]);
        let now = Utc::now();
        db.upsert_session(1, "tok", now + Duration::hours(1), now).unwrap();
        assert!(db.deactivate_session("tok").unwrap());

        let again = db.upsert_session(1, "tok", now + Duration::hours(1), now).unwrap();
        assert!(!again.is_active);
    }
}
