//! Database row types. Conversation and identity rows stay in this crate;
//! messages map straight onto `xchange_types::models::Message`.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;

use xchange_types::models::{Participant, Role};

pub struct IdentityRow {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub role: Role,
}

pub struct ProductRow {
    pub id: String,
    pub name: String,
    pub price: Option<f64>,
    pub image_url: Option<String>,
    pub seller_id: Option<String>,
}

pub struct ConversationRow {
    pub id: String,
    /// Canonically ordered by identity id.
    pub participants: [Participant; 2],
    pub product_ref: Option<String>,
    pub last_message_preview: String,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub unread_counts: HashMap<String, u32>,
}

impl ConversationRow {
    pub fn has_participant(&self, identity_id: &str) -> bool {
        self.participants.iter().any(|p| p.identity_id == identity_id)
    }

    /// The participant that is not `identity_id`, if `identity_id` is one.
    pub fn other_participant(&self, identity_id: &str) -> Option<&Participant> {
        let [a, b] = &self.participants;
        if a.identity_id == identity_id {
            Some(b)
        } else if b.identity_id == identity_id {
            Some(a)
        } else {
            None
        }
    }

    pub fn unread_for(&self, identity_id: &str) -> u32 {
        self.unread_counts.get(identity_id).copied().unwrap_or(0)
    }
}

/// Fixed-width RFC 3339 so that lexical order in SQLite is chronological.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

/// Read a text column through `FromStr`, reporting failures as a column
/// conversion error so they surface from `query_map` like any other.
pub(crate) fn parse_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

pub(crate) fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
