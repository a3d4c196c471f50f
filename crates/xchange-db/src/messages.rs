use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::{debug, trace};
use uuid::Uuid;

use xchange_types::models::{Message, MessageKind, ProductContext};

use crate::conversations::{
    increment_unread_in, query_conversation, reset_unread_in, touch_last_message_in,
};
use crate::models::{format_ts, parse_column, parse_ts, ts_column};
use crate::{Database, OptionalExt, StoreError, StoreResult};

/// A message about to be appended.
pub struct NewMessage<'a> {
    pub conversation_id: &'a str,
    pub sender_id: &'a str,
    pub kind: MessageKind,
    pub body: &'a str,
    pub product_context: Option<&'a ProductContext>,
}

/// Denormalized conversation fields updated together with an append.
pub struct MessageEffects<'a> {
    pub preview: &'a str,
    /// Participant whose unread counter goes up, if any.
    pub notify: Option<&'a str>,
}

impl Database {
    /// Append a message. The body is stored trimmed and must not be empty.
    pub fn append_message(&self, msg: &NewMessage<'_>, now: DateTime<Utc>) -> StoreResult<Message> {
        self.with_tx(|conn| insert_message(conn, msg, now))
    }

    /// Append a message and apply its effects on the conversation in one
    /// transaction: either all of it lands or none of it does.
    pub fn record_message(
        &self,
        msg: &NewMessage<'_>,
        effects: &MessageEffects<'_>,
        now: DateTime<Utc>,
    ) -> StoreResult<Message> {
        self.with_tx(|conn| {
            let message = insert_message(conn, msg, now)?;
            touch_last_message_in(conn, msg.conversation_id, effects.preview, message.created_at)?;
            if let Some(recipient) = effects.notify {
                increment_unread_in(conn, msg.conversation_id, recipient)?;
            }
            Ok(message)
        })
    }

    /// Messages in `(created_at, seq)` order. Each call is a fresh snapshot.
    pub fn list_messages(&self, conversation_id: &str) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, id, conversation_id, sender_id, kind, body, product_context, created_at, read
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC, seq ASC",
            )?;
            let rows = stmt
                .query_map([conversation_id], map_message)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Mark every unread message not sent by `exclude_sender_id` as read.
    /// Returns how many rows changed.
    pub fn mark_read_except(
        &self,
        conversation_id: &str,
        exclude_sender_id: &str,
    ) -> StoreResult<usize> {
        self.with_conn_mut(|conn| mark_read_in(conn, conversation_id, exclude_sender_id, i64::MAX))
    }

    /// Mark as read what `reader_id` has seen (messages up to `through_seq`
    /// from the other party) and reconcile their unread counter, in one
    /// transaction. Messages appended after the snapshot keep counting.
    pub fn acknowledge_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        through_seq: i64,
    ) -> StoreResult<usize> {
        self.with_tx(|conn| {
            // System messages never enter the counter, so only user messages
            // are subtracted from it.
            let counted: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0
                   AND seq <= ?3 AND kind = 'user'",
                rusqlite::params![conversation_id, reader_id, through_seq],
                |row| row.get(0),
            )?;
            let marked = mark_read_in(conn, conversation_id, reader_id, through_seq)?;
            reset_unread_in(conn, conversation_id, reader_id, counted as usize)?;

            // Self-heal drift: the counter can never exceed what is really unread.
            let still_unread: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0 AND kind = 'user'",
                (conversation_id, reader_id),
                |row| row.get(0),
            )?;
            conn.execute(
                "UPDATE unread_counts SET count = MIN(count, ?3)
                 WHERE conversation_id = ?1 AND identity_id = ?2",
                rusqlite::params![conversation_id, reader_id, still_unread],
            )?;

            trace!("{} acknowledged {} messages in {}", reader_id, marked, conversation_id);
            Ok(marked)
        })
    }
}

pub(crate) fn insert_message(conn: &Connection, msg: &NewMessage<'_>, now: DateTime<Utc>) -> StoreResult<Message> {
    let body = msg.body.trim();
    if body.is_empty() {
        return Err(StoreError::InvalidArgument("message body is empty".into()));
    }

    let conversation = query_conversation(conn, msg.conversation_id)?
        .ok_or_else(|| StoreError::NotFound(format!("conversation {}", msg.conversation_id)))?;
    if !conversation.has_participant(msg.sender_id) {
        return Err(StoreError::InvalidArgument(format!(
            "{} is not a participant of {}",
            msg.sender_id, msg.conversation_id
        )));
    }

    // Timestamps never go backwards within a conversation, even if the
    // wall clock does.
    let latest: Option<String> = conn
        .query_row(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1",
            [msg.conversation_id],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    let created_at = match latest.as_deref().map(parse_ts) {
        Some(Ok(prev)) if prev > now => prev,
        Some(Err(e)) => return Err(StoreError::Corrupt(format!("created_at: {}", e))),
        _ => now,
    };

    // Product context belongs only on the first message of a product inquiry.
    let product_context = msg
        .product_context
        .filter(|_| conversation.product_ref.is_some() && latest.is_none());
    if msg.product_context.is_some() && product_context.is_none() {
        debug!("Dropping product context on message in {}", msg.conversation_id);
    }

    let context_json = product_context
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::InvalidArgument(format!("product context: {}", e)))?;

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, kind, body, product_context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            id,
            msg.conversation_id,
            msg.sender_id,
            msg.kind.as_str(),
            body,
            context_json,
            format_ts(created_at)
        ],
    )?;
    let sequence = conn.last_insert_rowid();

    debug!("Appended message {} (seq {}) to {}", id, sequence, msg.conversation_id);
    Ok(Message {
        id,
        conversation_id: msg.conversation_id.to_string(),
        sender_id: msg.sender_id.to_string(),
        kind: msg.kind,
        body: body.to_string(),
        product_context: product_context.cloned(),
        // Round-trip through storage precision so callers see what readers see.
        created_at: parse_ts(&format_ts(created_at))
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        sequence,
        read: false,
    })
}

fn mark_read_in(
    conn: &Connection,
    conversation_id: &str,
    exclude_sender_id: &str,
    through_seq: i64,
) -> StoreResult<usize> {
    let changed = conn.execute(
        "UPDATE messages SET read = 1
         WHERE conversation_id = ?1 AND sender_id != ?2 AND read = 0 AND seq <= ?3",
        rusqlite::params![conversation_id, exclude_sender_id, through_seq],
    )?;
    Ok(changed)
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let context: Option<String> = row.get(6)?;
    let product_context = context
        .map(|raw| serde_json::from_str::<ProductContext>(&raw))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        sequence: row.get(0)?,
        id: row.get(1)?,
        conversation_id: row.get(2)?,
        sender_id: row.get(3)?,
        kind: parse_column(row, 4)?,
        body: row.get(5)?,
        product_context,
        created_at: ts_column(row, 7)?,
        read: row.get(8)?,
    })
}
