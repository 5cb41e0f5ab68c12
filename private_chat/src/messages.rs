use crate::db::DbPool;
use crate::model::{Message, NewMessage};
use anyhow::Result;
use rusqlite::{params, Connection};
use time::OffsetDateTime;
use uuid::Uuid;

/// Durable, append-only record of private messages.
pub trait MessageLog: Send + Sync {
    /// Store a message and return it with its id and timestamp. Returns only
    /// once the row is committed.
    fn append(&self, msg: &NewMessage) -> Result<Message>;

    /// Every message exchanged between `a` and `b`, oldest first.
    fn query_conversation(&self, a: &str, b: &str) -> Result<Vec<Message>>;
}

/// Deterministic key for the conversation between two users, independent of
/// argument order.
pub fn conversation_id(a: &str, b: &str) -> Uuid {
    let (min, max) = if a <= b { (a, b) } else { (b, a) };
    let name = format!("dm:{}\u{0}{}", min, max);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Insert a message. The timestamp is the wall clock, bumped past the latest
/// stored timestamp so that it is strictly increasing; the single statement
/// makes read and insert atomic.
pub fn append_message(conn: &Connection, msg: &NewMessage) -> Result<Message> {
    let (id, timestamp): (i64, i64) = conn.query_row(
        "INSERT INTO messages (conversation, sender, recipient, body, attachment, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, MAX(?6, COALESCE((SELECT MAX(created_at) FROM messages), 0) + 1)) \
         RETURNING id, created_at",
        params![
            conversation_id(&msg.from, &msg.to).to_string(),
            msg.from,
            msg.to,
            msg.message,
            msg.attachment,
            now_millis()
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(Message {
        id,
        from: msg.from.clone(),
        to: msg.to.clone(),
        message: msg.message.clone(),
        attachment: msg.attachment.clone(),
        timestamp,
    })
}

fn row_to_msg(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        from: row.get(1)?,
        to: row.get(2)?,
        message: row.get(3)?,
        attachment: row.get(4)?,
        timestamp: row.get(5)?,
    })
}

/// List the conversation between two users in ascending timestamp order.
pub fn list_conversation(conn: &Connection, a: &str, b: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, sender, recipient, body, attachment, created_at FROM messages \
         WHERE conversation = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let msgs = stmt
        .query_map([conversation_id(a, b).to_string()], row_to_msg)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}

/// [`MessageLog`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteMessageLog {
    pool: DbPool,
}

impl SqliteMessageLog {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl MessageLog for SqliteMessageLog {
    fn append(&self, msg: &NewMessage) -> Result<Message> {
        let conn = self.pool.get()?;
        append_message(&conn, msg)
    }

    fn query_conversation(&self, a: &str, b: &str) -> Result<Vec<Message>> {
        let conn = self.pool.get()?;
        list_conversation(&conn, a, b)
    }
}
