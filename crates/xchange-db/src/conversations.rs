use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use tracing::debug;

use xchange_types::models::{Message, Participant};

use crate::messages::{NewMessage, insert_message};
use crate::models::{ConversationRow, format_ts, parse_column, ts_column};
use crate::{Database, OptionalExt, StoreError, StoreResult};

const CONVERSATION_COLUMNS: &str = "id, participant_a, role_a, participant_b, role_b, product_ref,
     last_message_preview, last_message_at, created_at";

impl Database {
    pub fn find_conversation(&self, id: &str) -> StoreResult<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Participant match is unordered; `product_ref` must match exactly,
    /// including both being absent.
    pub fn find_conversation_by_participants(
        &self,
        id_a: &str,
        id_b: &str,
        product_ref: Option<&str>,
    ) -> StoreResult<Option<ConversationRow>> {
        let (lo, hi) = ordered(id_a, id_b);
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM conversations
                 WHERE participant_a = ?1 AND participant_b = ?2 AND product_ref IS ?3",
                CONVERSATION_COLUMNS
            );
            let row = conn
                .query_row(&sql, rusqlite::params![lo, hi, product_ref], map_conversation)
                .optional()?;
            match row {
                Some(mut row) => {
                    load_unread(conn, std::slice::from_mut(&mut row))?;
                    Ok(Some(row))
                }
                None => Ok(None),
            }
        })
    }

    /// Insert a conversation. The unique index on (pair, product_ref) makes
    /// this atomic: a concurrent duplicate fails with `StoreError::Conflict`.
    pub fn create_conversation(
        &self,
        id: &str,
        a: &Participant,
        b: &Participant,
        product_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<ConversationRow> {
        let (first, second) = canonical_pair(a, b)?;
        self.with_tx(|conn| {
            insert_conversation(conn, id, first, second, product_ref, now)?;
            query_conversation(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))
        })
    }

    /// Like `create_conversation`, but the conversation becomes visible only
    /// together with its opening message. `opening.conversation_id` is
    /// ignored in favour of `id`. The opening message never counts as unread.
    pub fn create_conversation_with_opening(
        &self,
        id: &str,
        a: &Participant,
        b: &Participant,
        product_ref: Option<&str>,
        opening: &NewMessage<'_>,
        preview: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<(ConversationRow, Message)> {
        let (first, second) = canonical_pair(a, b)?;
        self.with_tx(|conn| {
            insert_conversation(conn, id, first, second, product_ref, now)?;

            let msg = NewMessage {
                conversation_id: id,
                sender_id: opening.sender_id,
                kind: opening.kind,
                body: opening.body,
                product_context: opening.product_context,
            };
            let message = insert_message(conn, &msg, now)?;
            touch_last_message_in(conn, id, preview, message.created_at)?;

            let row = query_conversation(conn, id)?
                .ok_or_else(|| StoreError::NotFound(format!("conversation {}", id)))?;
            Ok((row, message))
        })
    }

    /// All conversations involving `identity_id`, most recent activity first.
    pub fn list_conversations_for(&self, identity_id: &str) -> StoreResult<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM conversations
                 WHERE participant_a = ?1 OR participant_b = ?1
                 ORDER BY last_message_at DESC, created_at DESC, id",
                CONVERSATION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map([identity_id], map_conversation)?
                .collect::<Result<Vec<_>, _>>()?;
            load_unread(conn, &mut rows)?;
            Ok(rows)
        })
    }

    /// Returns `false` (and changes nothing) when `at` is older than the
    /// stored `last_message_at`.
    pub fn touch_last_message(
        &self,
        conversation_id: &str,
        preview: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.with_conn_mut(|conn| touch_last_message_in(conn, conversation_id, preview, at))
    }

    pub fn increment_unread(&self, conversation_id: &str, identity_id: &str) -> StoreResult<()> {
        self.with_conn_mut(|conn| increment_unread_in(conn, conversation_id, identity_id))
    }

    /// Subtract the number of messages actually marked read, never going
    /// below zero, so increments that raced the read are kept.
    pub fn reset_unread(
        &self,
        conversation_id: &str,
        identity_id: &str,
        marked: usize,
    ) -> StoreResult<()> {
        self.with_conn_mut(|conn| reset_unread_in(conn, conversation_id, identity_id, marked))
    }

    pub fn total_unread(&self, identity_id: &str) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(count), 0) FROM unread_counts WHERE identity_id = ?1",
                [identity_id],
                |row| row.get(0),
            )?;
            Ok(total.max(0) as u64)
        })
    }

    /// Delete every conversation involving `identity_id`, together with their
    /// messages and counters. Returns (conversations, messages) removed.
    pub fn delete_all_for_identity(&self, identity_id: &str) -> StoreResult<(usize, usize)> {
        self.with_tx(|conn| {
            let messages = conn.execute(
                "DELETE FROM messages WHERE conversation_id IN
                    (SELECT id FROM conversations WHERE participant_a = ?1 OR participant_b = ?1)",
                [identity_id],
            )?;
            let conversations = conn.execute(
                "DELETE FROM conversations WHERE participant_a = ?1 OR participant_b = ?1",
                [identity_id],
            )?;
            Ok((conversations, messages))
        })
    }
}

fn canonical_pair<'a>(
    a: &'a Participant,
    b: &'a Participant,
) -> StoreResult<(&'a Participant, &'a Participant)> {
    if a.identity_id == b.identity_id {
        return Err(StoreError::InvalidArgument(
            "a conversation needs two distinct participants".into(),
        ));
    }
    Ok(if a.identity_id < b.identity_id { (a, b) } else { (b, a) })
}

fn insert_conversation(
    conn: &Connection,
    id: &str,
    first: &Participant,
    second: &Participant,
    product_ref: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO conversations
            (id, participant_a, role_a, participant_b, role_b, product_ref, last_message_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        rusqlite::params![
            id,
            first.identity_id,
            first.role.as_str(),
            second.identity_id,
            second.role.as_str(),
            product_ref,
            format_ts(now)
        ],
    )
    .map_err(constraint_to_conflict)?;

    for p in [first, second] {
        conn.execute(
            "INSERT INTO unread_counts (conversation_id, identity_id, count) VALUES (?1, ?2, 0)",
            (id, &p.identity_id),
        )?;
    }

    debug!("Created conversation {} ({} <-> {})", id, first.identity_id, second.identity_id);
    Ok(())
}

pub(crate) fn query_conversation(conn: &Connection, id: &str) -> StoreResult<Option<ConversationRow>> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    let row = conn.query_row(&sql, [id], map_conversation).optional()?;
    match row {
        Some(mut row) => {
            load_unread(conn, std::slice::from_mut(&mut row))?;
            Ok(Some(row))
        }
        None => Ok(None),
    }
}

pub(crate) fn touch_last_message_in(
    conn: &Connection,
    conversation_id: &str,
    preview: &str,
    at: DateTime<Utc>,
) -> StoreResult<bool> {
    let changed = conn.execute(
        "UPDATE conversations SET last_message_preview = ?2, last_message_at = ?3
         WHERE id = ?1 AND last_message_at <= ?3",
        (conversation_id, preview, format_ts(at)),
    )?;
    Ok(changed > 0)
}

pub(crate) fn increment_unread_in(
    conn: &Connection,
    conversation_id: &str,
    identity_id: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO unread_counts (conversation_id, identity_id, count) VALUES (?1, ?2, 1)
         ON CONFLICT (conversation_id, identity_id) DO UPDATE SET count = count + 1",
        (conversation_id, identity_id),
    )?;
    Ok(())
}

pub(crate) fn reset_unread_in(
    conn: &Connection,
    conversation_id: &str,
    identity_id: &str,
    marked: usize,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE unread_counts SET count = MAX(count - ?3, 0)
         WHERE conversation_id = ?1 AND identity_id = ?2",
        rusqlite::params![conversation_id, identity_id, marked as i64],
    )?;
    Ok(())
}

fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participants: [
            Participant {
                identity_id: row.get(1)?,
                role: parse_column(row, 2)?,
            },
            Participant {
                identity_id: row.get(3)?,
                role: parse_column(row, 4)?,
            },
        ],
        product_ref: row.get(5)?,
        last_message_preview: row.get(6)?,
        last_message_at: ts_column(row, 7)?,
        created_at: ts_column(row, 8)?,
        unread_counts: HashMap::new(),
    })
}

fn load_unread(conn: &Connection, rows: &mut [ConversationRow]) -> StoreResult<()> {
    let mut stmt = conn.prepare_cached(
        "SELECT identity_id, count FROM unread_counts WHERE conversation_id = ?1",
    )?;
    for row in rows.iter_mut() {
        let counts = stmt
            .query_map([&row.id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        row.unread_counts = counts
            .into_iter()
            .map(|(id, count)| (id, count.max(0) as u32))
            .collect();
    }
    Ok(())
}

fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

fn constraint_to_conflict(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY) =>
        {
            StoreError::Conflict
        }
        _ => StoreError::Sqlite(err),
    }
}
