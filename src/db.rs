//! Database module for medipredict
//!
//! Provides persistence for conversations, their message logs, and
//! prediction records.

mod schema;

pub use schema::*;

use crate::parameters::DiseaseType;
use crate::predictor::PredictionOutcome;
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Prediction not found: {0}")]
    PredictionNotFound(String),
    #[error("Message index {index} is out of range (conversation has {len} messages)")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Message {0} is not a user message")]
    NotUserMessage(usize),
    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

const CONVERSATION_COLUMNS: &str = "id, user_id, title, status, message_count, last_message, last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "conversation_id, position, message_type, content, status, metadata, timestamp";
const PREDICTION_COLUMNS: &str = "id, user_id, conversation_id, disease_type, parameters, status, result, follow_up_questions, recommendations, created_at, updated_at";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new, empty conversation owned by `user_id`
    pub fn create_conversation(&self, id: &str, user_id: &str) -> DbResult<Conversation> {
        let conn = self.conn()?;
        let now = now();

        conn.execute(
            "INSERT INTO conversations (id, user_id, title, status, message_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', 0, ?4, ?4)",
            params![id, user_id, DEFAULT_TITLE, fmt_datetime(now)],
        )?;

        Ok(Conversation {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: DEFAULT_TITLE.to_string(),
            status: ConversationStatus::Active,
            message_count: 0,
            last_message: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id],
            parse_conversation_row,
        )
        .optional()?
        .ok_or_else(|| DbError::ConversationNotFound(id.to_string()))
    }

    /// Get a conversation, treating another user's conversation as missing
    pub fn conversation_for_user(&self, id: &str, user_id: &str) -> DbResult<Conversation> {
        let conv = self.get_conversation(id)?;
        if conv.user_id == user_id {
            Ok(conv)
        } else {
            Err(DbError::ConversationNotFound(id.to_string()))
        }
    }

    /// List a user's conversations, most recently updated first
    pub fn list_conversations(&self, user_id: &str) -> DbResult<Vec<Conversation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations
             WHERE user_id = ?1 ORDER BY updated_at DESC, created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn set_conversation_status(&self, id: &str, status: ConversationStatus) -> DbResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE conversations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), fmt_datetime(now()), id],
        )?;
        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a conversation and its whole message log. Scoped to the owner.
    pub fn delete_conversation(&self, id: &str, user_id: &str) -> DbResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let deleted = tx.execute(
            "DELETE FROM conversations WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if deleted == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        tx.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
        tx.execute(
            "UPDATE predictions SET conversation_id = NULL WHERE conversation_id = ?1",
            params![id],
        )?;

        tx.commit()?;
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append one message. Content, position, and the conversation's
    /// count/summary fields are written in a single transaction.
    #[cfg(test)]
    pub fn append_message(&self, conversation_id: &str, message: &NewMessage) -> DbResult<Message> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let saved = append_in(&tx, conversation_id, message)?;
        tx.commit()?;
        Ok(saved)
    }

    /// Append a user turn and its AI reply as one unit, user first
    pub fn append_exchange(
        &self,
        conversation_id: &str,
        user: &NewMessage,
        ai: &NewMessage,
    ) -> DbResult<(Message, Message)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let user = append_in(&tx, conversation_id, user)?;
        let ai = append_in(&tx, conversation_id, ai)?;
        tx.commit()?;
        Ok((user, ai))
    }

    /// Full ordered message log
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 ORDER BY position ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// The last `limit` messages, oldest first
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> DbResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
             ORDER BY position DESC LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![conversation_id, limit], parse_message_row)?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Message at `index` in the log
    pub fn get_message(&self, conversation_id: &str, index: usize) -> DbResult<Message> {
        let conn = self.conn()?;
        let len = message_count(&conn, conversation_id)?;
        if index >= len {
            return Err(DbError::IndexOutOfRange { index, len });
        }
        let position = i64::try_from(index).unwrap_or(i64::MAX);
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 AND position = ?2"),
            params![conversation_id, position],
            parse_message_row,
        )
        .optional()?
        .ok_or(DbError::IndexOutOfRange { index, len })
    }

    /// Replace the metadata of the `index`-th message; nothing else changes
    pub fn update_message_metadata(
        &self,
        conversation_id: &str,
        index: usize,
        metadata: &MessageMetadata,
    ) -> DbResult<Message> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let len = message_count(&tx, conversation_id)?;
        if index >= len {
            return Err(DbError::IndexOutOfRange { index, len });
        }
        let position = i64::try_from(index).unwrap_or(i64::MAX);
        let mut message = tx.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1 AND position = ?2"),
            params![conversation_id, position],
            parse_message_row,
        )?;
        if message.message_type != MessageType::User {
            return Err(DbError::NotUserMessage(index));
        }

        tx.execute(
            "UPDATE messages SET metadata = ?1 WHERE conversation_id = ?2 AND position = ?3",
            params![serde_json::to_string(metadata)?, conversation_id, position],
        )?;
        tx.commit()?;

        message.metadata = Some(metadata.clone());
        Ok(message)
    }

    // ==================== Prediction Operations ====================

    pub fn create_prediction(
        &self,
        id: &str,
        user_id: &str,
        conversation_id: Option<&str>,
        disease: DiseaseType,
    ) -> DbResult<PredictionRecord> {
        let conn = self.conn()?;
        let now = now();

        conn.execute(
            "INSERT INTO predictions (id, user_id, conversation_id, disease_type, parameters, status, follow_up_questions, recommendations, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '{}', ?5, '[]', '[]', ?6, ?6)",
            params![
                id,
                user_id,
                conversation_id,
                disease.as_str(),
                PredictionStatus::Pending.as_str(),
                fmt_datetime(now)
            ],
        )?;

        Ok(PredictionRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            conversation_id: conversation_id.map(String::from),
            disease_type: disease,
            parameters: BTreeMap::new(),
            status: PredictionStatus::Pending,
            result: None,
            follow_up_questions: Vec::new(),
            recommendations: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_prediction(&self, id: &str) -> DbResult<PredictionRecord> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {PREDICTION_COLUMNS} FROM predictions WHERE id = ?1"),
            params![id],
            parse_prediction_row,
        )
        .optional()?
        .ok_or_else(|| DbError::PredictionNotFound(id.to_string()))
    }

    /// Get a prediction, treating another user's record as missing
    pub fn prediction_for_user(&self, id: &str, user_id: &str) -> DbResult<PredictionRecord> {
        let record = self.get_prediction(id)?;
        if record.user_id == user_id {
            Ok(record)
        } else {
            Err(DbError::PredictionNotFound(id.to_string()))
        }
    }

    /// A user's predictions, newest first
    pub fn list_predictions(&self, user_id: &str) -> DbResult<Vec<PredictionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PREDICTION_COLUMNS} FROM predictions WHERE user_id = ?1 ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], parse_prediction_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Most recent still-pending prediction attached to a conversation
    pub fn latest_pending_prediction(&self, conversation_id: &str) -> DbResult<Option<PredictionRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {PREDICTION_COLUMNS} FROM predictions
                 WHERE conversation_id = ?1 AND status = ?2
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![conversation_id, PredictionStatus::Pending.as_str()],
            parse_prediction_row,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn update_prediction_parameters(
        &self,
        id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> DbResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE predictions SET parameters = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(parameters)?, fmt_datetime(now()), id],
        )?;
        ensure_prediction_updated(updated, id)
    }

    pub fn update_prediction_guidance(
        &self,
        id: &str,
        follow_up_questions: &[String],
        recommendations: &[String],
    ) -> DbResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE predictions SET follow_up_questions = ?1, recommendations = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(follow_up_questions)?,
                serde_json::to_string(recommendations)?,
                fmt_datetime(now()),
                id
            ],
        )?;
        ensure_prediction_updated(updated, id)
    }

    /// Store the predictor's answer and mark the record completed
    pub fn complete_prediction(&self, id: &str, outcome: &PredictionOutcome) -> DbResult<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE predictions SET result = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(outcome)?,
                PredictionStatus::Completed.as_str(),
                fmt_datetime(now()),
                id
            ],
        )?;
        ensure_prediction_updated(updated, id)
    }

    /// Delete a prediction. Scoped to the owner.
    pub fn delete_prediction(&self, id: &str, user_id: &str) -> DbResult<()> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM predictions WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        ensure_prediction_updated(deleted, id)
    }
}

/// Append inside an open transaction. Timestamps never go backwards within
/// a conversation even if the wall clock does.
fn append_in(tx: &Transaction<'_>, conversation_id: &str, message: &NewMessage) -> DbResult<Message> {
    let (count, title, last_at): (i64, String, Option<String>) = tx
        .query_row(
            "SELECT message_count, title, last_message_at FROM conversations WHERE id = ?1",
            params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| DbError::ConversationNotFound(conversation_id.to_string()))?;

    let mut timestamp = now();
    if let Some(last) = last_at.as_deref().map(parse_datetime) {
        timestamp = timestamp.max(last);
    }

    let metadata = message
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    tx.execute(
        "INSERT INTO messages (conversation_id, position, message_type, content, status, metadata, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conversation_id,
            count,
            message.message_type.to_string(),
            message.content,
            message.status.as_str(),
            metadata,
            fmt_datetime(timestamp),
        ],
    )?;

    let title = match (&message.message_type, &message.content) {
        (MessageType::User, Some(content)) if title == DEFAULT_TITLE => derive_title(content),
        _ => title,
    };

    tx.execute(
        "UPDATE conversations
         SET message_count = ?1, title = ?2, last_message = COALESCE(?3, last_message),
             last_message_at = ?4, updated_at = ?4
         WHERE id = ?5",
        params![count + 1, title, message.content, fmt_datetime(timestamp), conversation_id],
    )?;

    Ok(Message {
        conversation_id: conversation_id.to_string(),
        index: count,
        message_type: message.message_type,
        content: message.content.clone(),
        status: message.status,
        metadata: message.metadata.clone(),
        timestamp,
    })
}

fn message_count(conn: &Connection, conversation_id: &str) -> DbResult<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT message_count FROM conversations WHERE id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| DbError::ConversationNotFound(conversation_id.to_string()))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn ensure_prediction_updated(rows: usize, id: &str) -> DbResult<()> {
    if rows == 0 {
        Err(DbError::PredictionNotFound(id.to_string()))
    } else {
        Ok(())
    }
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        status: ConversationStatus::parse(&row.get::<_, String>(3)?),
        message_count: row.get(4)?,
        last_message: row.get(5)?,
        last_message_at: row.get::<_, Option<String>>(6)?.as_deref().map(parse_datetime),
        created_at: parse_datetime(&row.get::<_, String>(7)?),
        updated_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let message_type = if row.get::<_, String>(2)? == "user" {
        MessageType::User
    } else {
        MessageType::Ai
    };
    let status = if row.get::<_, String>(4)? == "pending" {
        MessageStatus::Pending
    } else {
        MessageStatus::Completed
    };

    Ok(Message {
        conversation_id: row.get(0)?,
        index: row.get(1)?,
        message_type,
        content: row.get(3)?,
        status,
        metadata: row
            .get::<_, Option<String>>(5)?
            .map(|s| json_column(5, &s))
            .transpose()?,
        timestamp: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn parse_prediction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PredictionRecord> {
    let disease_type = row
        .get::<_, String>(3)?
        .parse::<DiseaseType>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e)))?;
    let status = if row.get::<_, String>(5)? == "completed" {
        PredictionStatus::Completed
    } else {
        PredictionStatus::Pending
    };

    Ok(PredictionRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        conversation_id: row.get(2)?,
        disease_type,
        parameters: json_column(4, &row.get::<_, String>(4)?)?,
        status,
        result: row
            .get::<_, Option<String>>(6)?
            .map(|s| json_column(6, &s))
            .transpose()?,
        follow_up_questions: json_column(7, &row.get::<_, String>(7)?)?,
        recommendations: json_column(8, &row.get::<_, String>(8)?)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

/// Decode a JSON text column; corrupt data is a conversion failure, not a default
fn json_column<T: serde::de::DeserializeOwned>(index: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Current time at the precision timestamps are stored with
fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
