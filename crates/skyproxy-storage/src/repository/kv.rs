//! Key-value repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::warn;

use crate::error::Result;
use crate::models::Entry;

const UPSERT: &str = "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
     ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = datetime('now')";

/// Repository for key-value operations.
pub struct KvRepo;

impl KvRepo {
    /// Get a record. Only a missing row reads as `None`; any other
    /// database error is returned.
    pub fn get(conn: &Connection, key: &str) -> Result<Option<Entry>> {
        let mut stmt =
            conn.prepare("SELECT key, value, updated_at FROM kv_store WHERE key = ?1")?;

        let entry = stmt.query_row([key], entry_from_row).optional()?;

        Ok(entry)
    }

    /// Set a record (insert or update).
    pub fn set(conn: &Connection, key: &str, value: &serde_json::Value) -> Result<()> {
        let value_json = serde_json::to_string(value)?;
        conn.execute(UPSERT, params![key, value_json])?;
        Ok(())
    }

    /// Set several records in one transaction; either all are written or none.
    pub fn set_many(conn: &mut Connection, entries: &[(&str, serde_json::Value)]) -> Result<()> {
        let tx = conn.transaction()?;
        for (key, value) in entries {
            let value_json = serde_json::to_string(value)?;
            tx.execute(UPSERT, params![key, value_json])?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<Entry> {
    let key: String = row.get(0)?;
    let value_str: String = row.get(1)?;
    let value = serde_json::from_str(&value_str).unwrap_or_else(|e| {
        warn!(key = %key, error = %e, "Stored value is not valid JSON, reading as null");
        serde_json::Value::Null
    });

    Ok(Entry {
        key,
        value,
        updated_at: parse_datetime(&row.get::<_, String>(2)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}
