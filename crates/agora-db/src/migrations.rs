use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            -- Filled by the identity service; the hub only reads it.
            CREATE TABLE users (
                id                  INTEGER PRIMARY KEY,
                username            TEXT NOT NULL UNIQUE,
                role                TEXT NOT NULL DEFAULT 'user',
                status              TEXT NOT NULL DEFAULT 'offline',
                reputation_score    INTEGER NOT NULL DEFAULT 0,
                is_banned           INTEGER NOT NULL DEFAULT 0,
                is_muted            INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE conversations (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                kind            TEXT NOT NULL,
                name            TEXT,
                owner_id        INTEGER NOT NULL REFERENCES users(id),
                is_public       INTEGER NOT NULL DEFAULT 0,
                is_archived     INTEGER NOT NULL DEFAULT 0,
                max_members     INTEGER NOT NULL,
                dm_key          TEXT UNIQUE,
                last_message_id INTEGER,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );

            CREATE TABLE conversation_members (
                conversation_id INTEGER NOT NULL REFERENCES conversations(id),
                user_id         INTEGER NOT NULL REFERENCES users(id),
                role            TEXT NOT NULL DEFAULT 'member',
                joined_at       TEXT NOT NULL,
                left_at         TEXT,
                is_muted        INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_members_user
                ON conversation_members(user_id) WHERE left_at IS NULL;

            CREATE TABLE messages (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id     INTEGER NOT NULL REFERENCES conversations(id),
                author_id           INTEGER NOT NULL REFERENCES users(id),
                content             TEXT NOT NULL,
                message_type        TEXT NOT NULL DEFAULT 'text',
                parent_message_id   INTEGER REFERENCES messages(id),
                status              TEXT NOT NULL DEFAULT 'sent',
                is_pinned           INTEGER NOT NULL DEFAULT 0,
                is_edited           INTEGER NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, id);

            CREATE TABLE message_history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id  INTEGER NOT NULL REFERENCES messages(id),
                old_content TEXT NOT NULL,
                edited_by   INTEGER NOT NULL,
                edited_at   TEXT NOT NULL
            );

            CREATE INDEX idx_history_message
                ON message_history(message_id, id);

            CREATE TABLE message_mentions (
                message_id          INTEGER NOT NULL REFERENCES messages(id),
                mentioned_user_id   INTEGER NOT NULL REFERENCES users(id),
                is_read             INTEGER NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                PRIMARY KEY (message_id, mentioned_user_id)
            );

            CREATE INDEX idx_mentions_user
                ON message_mentions(mentioned_user_id, is_read);

            CREATE TABLE message_reactions (
                message_id      INTEGER NOT NULL REFERENCES messages(id),
                user_id         INTEGER NOT NULL REFERENCES users(id),
                reaction_type   TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                PRIMARY KEY (message_id, user_id, reaction_type)
            );

            CREATE TABLE read_receipts (
                conversation_id         INTEGER NOT NULL REFERENCES conversations(id),
                user_id                 INTEGER NOT NULL REFERENCES users(id),
                last_read_message_id    INTEGER NOT NULL,
                updated_at              TEXT NOT NULL,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE TABLE sanctions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id),
                moderator_id    INTEGER NOT NULL,
                sanction_type   TEXT NOT NULL,
                reason          TEXT NOT NULL,
                conversation_id INTEGER REFERENCES conversations(id),
                created_at      TEXT NOT NULL,
                expires_at      TEXT,
                is_active       INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX idx_sanctions_user
                ON sanctions(user_id) WHERE is_active = 1;

            CREATE TABLE user_sessions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER NOT NULL REFERENCES users(id),
                session_token   TEXT NOT NULL UNIQUE,
                created_at      TEXT NOT NULL,
                last_activity   TEXT NOT NULL,
                expires_at      TEXT NOT NULL,
                is_active       INTEGER NOT NULL DEFAULT 1
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (audit log)");
        conn.execute_batch(
            "
            CREATE TABLE audit_log (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                action          TEXT NOT NULL,
                actor_id        INTEGER NOT NULL,
                conversation_id INTEGER,
                target_user_id  INTEGER,
                message_id      INTEGER,
                details         TEXT NOT NULL DEFAULT '{}',
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_audit_conversation
                ON audit_log(conversation_id, id);

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }
}
