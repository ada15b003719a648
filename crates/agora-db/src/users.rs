use agora_types::UserId;
use agora_types::models::{Role, User};
use anyhow::Result;
use rusqlite::{Connection, Row};

use crate::{Database, OptionalExt, enum_col};

const USER_COLUMNS: &str =
    "id, username, role, status, reputation_score, is_banned, is_muted";

impl Database {
    /// Mirror a user from the identity service. The hub never calls this on
    /// its own; it exists for seeding and the identity sync job.
    pub fn upsert_user(&self, id: UserId, username: &str, role: Role) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, role) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username, role = excluded.role",
                rusqlite::params![id, username, role.as_str()],
            )?;
            Ok(())
        })
    }

    pub fn set_user_flags(&self, id: UserId, is_banned: bool, is_muted: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_banned = ?2, is_muted = ?3 WHERE id = ?1",
                rusqlite::params![id, is_banned, is_muted],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: UserId) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", rusqlite::params![id]))
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, "username = ?1", rusqlite::params![username]))
    }
}

fn query_user(conn: &Connection, filter: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, filter);
    conn.query_row(&sql, params, user_from_row).optional()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        role: enum_col(row, 2)?,
        status: enum_col(row, 3)?,
        reputation_score: row.get(4)?,
        is_banned: row.get(5)?,
        is_muted: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support::db_with_users;
    use agora_types::models::{Role, UserStatus};

    #[test]
    fn upsert_then_lookup() {
        let db = db_with_users(&[(1, "alice")]);
        db.upsert_user(1, "alice", Role::Moderator).unwrap();
        db.set_user_flags(1, false, true).unwrap();

        let user = db.get_user(1).unwrap().unwrap();
        assert_eq!(user.role, Role::Moderator);
        assert_eq!(user.status, UserStatus::Offline);
        assert!(user.is_muted);
        assert!(!user.is_banned);

        assert_eq!(db.get_user_by_username("alice").unwrap().unwrap().id, 1);
        assert!(db.get_user_by_username("nobody").unwrap().is_none());
    }
}
