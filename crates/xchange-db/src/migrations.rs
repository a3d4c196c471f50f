use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (accounts, catalog, messaging)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE members (
                id            TEXT PRIMARY KEY,
                display_name  TEXT NOT NULL,
                email         TEXT NOT NULL UNIQUE COLLATE NOCASE,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE admins (
                id            TEXT PRIMARY KEY,
                display_name  TEXT NOT NULL,
                email         TEXT NOT NULL UNIQUE COLLATE NOCASE,
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE products (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                price       REAL,
                image_url   TEXT,
                seller_id   TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            -- participant_a < participant_b: the pair is stored in canonical order
            CREATE TABLE conversations (
                id                    TEXT PRIMARY KEY,
                participant_a         TEXT NOT NULL,
                role_a                TEXT NOT NULL,
                participant_b         TEXT NOT NULL,
                role_b                TEXT NOT NULL,
                product_ref           TEXT,
                last_message_preview  TEXT NOT NULL DEFAULT '',
                last_message_at       TEXT NOT NULL,
                created_at            TEXT NOT NULL,
                CHECK (participant_a < participant_b)
            );

            CREATE UNIQUE INDEX idx_conversations_pair_product
                ON conversations(participant_a, participant_b, COALESCE(product_ref, ''));

            CREATE INDEX idx_conversations_b
                ON conversations(participant_b);

            CREATE TABLE unread_counts (
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                identity_id      TEXT NOT NULL,
                count            INTEGER NOT NULL DEFAULT 0 CHECK (count >= 0),
                PRIMARY KEY (conversation_id, identity_id)
            );

            CREATE TABLE messages (
                seq              INTEGER PRIMARY KEY AUTOINCREMENT,
                id               TEXT NOT NULL UNIQUE,
                conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id        TEXT NOT NULL,
                kind             TEXT NOT NULL DEFAULT 'user',
                body             TEXT NOT NULL CHECK (length(trim(body)) > 0),
                product_context  TEXT,
                created_at       TEXT NOT NULL,
                read             INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_messages_conversation
                ON messages(conversation_id, created_at, seq);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
