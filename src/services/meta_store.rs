//! Small keyed JSON store for bookkeeping that is not an observation:
//! migration markers, the remote snapshot and the pending-task map.

use crate::error::AppError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const REMOTE_SNAPSHOT_KEY: &str = "remote_snapshot";
pub const PENDING_TASKS_KEY: &str = "pending_tasks";

/// Key of the one-way marker written after migration `name` ran
pub fn migration_marker_key(name: &str) -> String {
    format!("migration:{}", name)
}

pub fn get_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>, AppError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_meta_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;

    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn set_json<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<(), AppError> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO sync_meta_store (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        params![key, raw],
    )?;
    Ok(())
}

pub fn contains(conn: &Connection, key: &str) -> Result<bool, AppError> {
    let found: Option<i32> = conn
        .query_row(
            "SELECT 1 FROM sync_meta_store WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}
