//! Durable FIFO of remote requests, one instance per queue name.
//!
//! Items live in the `request_queue` table ordered by `position`. A retried
//! item keeps its place at the front; `push_front` takes a position below the
//! current minimum.

use crate::error::AppError;
use crate::models::{ActionType, NewQueueItem, QueueItem, QueueName, QueuedRequest};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub struct RequestQueue {
    name: QueueName,
    draining: AtomicBool,
    rerun: AtomicBool,
}

/// Held by the single drain pass of a queue; released on drop
pub struct DrainGuard<'a> {
    queue: &'a RequestQueue,
}

impl DrainGuard<'_> {
    /// True if another drain was requested while this one ran
    pub fn take_rerun(&self) -> bool {
        self.queue.rerun.swap(false, Ordering::SeqCst)
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.queue.draining.store(false, Ordering::SeqCst);
    }
}

const SELECT_COLUMNS: &str =
    "id, request_id, obs_uuid, parent_action, remote_parent_id, payload, attempts, ignored, created_at";

type RawItem = (i64, String, String, String, Option<i64>, String, u32, bool, DateTime<Utc>);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

impl RequestQueue {
    pub fn new(name: QueueName) -> Self {
        Self {
            name,
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Claims the drain slot. `None` means a pass is already running; it is
    /// told to go round once more so newly queued items are not missed.
    pub fn try_begin_drain(&self) -> Option<DrainGuard<'_>> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.rerun.store(true, Ordering::SeqCst);
            log::debug!("Drain of {} queue already running", self.name.as_str());
            return None;
        }
        self.rerun.store(false, Ordering::SeqCst);
        Some(DrainGuard { queue: self })
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn push_back(&self, conn: &Connection, item: NewQueueItem) -> Result<QueueItem, AppError> {
        self.insert(conn, item, "COALESCE(MAX(position), 0) + 1")
    }

    pub fn push_front(&self, conn: &Connection, item: NewQueueItem) -> Result<QueueItem, AppError> {
        self.insert(conn, item, "COALESCE(MIN(position), 0) - 1")
    }

    fn insert(
        &self,
        conn: &Connection,
        item: NewQueueItem,
        position_expr: &str,
    ) -> Result<QueueItem, AppError> {
        let position: i64 = conn.query_row(
            &format!(
                "SELECT {} FROM request_queue WHERE queue = ?1",
                position_expr
            ),
            params![self.name.as_str()],
            |row| row.get(0),
        )?;

        let request_id = ulid::Ulid::new().to_string();
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO request_queue
                (request_id, queue, position, obs_uuid, parent_action, remote_parent_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                request_id,
                self.name.as_str(),
                position,
                item.obs_uuid.to_string(),
                item.parent_action.as_str(),
                item.remote_parent_id,
                serde_json::to_string(&item.request)?,
                created_at
            ],
        )?;

        log::debug!(
            "Queued {} for {} on {} queue",
            item.request.label(),
            item.obs_uuid,
            self.name.as_str()
        );

        Ok(QueueItem {
            id: conn.last_insert_rowid(),
            request_id,
            queue: self.name,
            obs_uuid: item.obs_uuid,
            parent_action: item.parent_action,
            remote_parent_id: item.remote_parent_id,
            request: item.request,
            attempts: 0,
            ignored: false,
            created_at,
        })
    }

    fn to_item(&self, raw: RawItem) -> Result<QueueItem, AppError> {
        let (
            id,
            request_id,
            obs_uuid,
            parent_action,
            remote_parent_id,
            payload,
            attempts,
            ignored,
            created_at,
        ) = raw;
        let obs_uuid = Uuid::parse_str(&obs_uuid)
            .map_err(|e| AppError::Consistency(format!("Bad queue uuid '{}': {}", obs_uuid, e)))?;
        let parent_action = ActionType::parse(&parent_action).ok_or_else(|| {
            AppError::Consistency(format!("Bad queue action '{}'", parent_action))
        })?;
        let request: QueuedRequest = serde_json::from_str(&payload)?;

        Ok(QueueItem {
            id,
            request_id,
            queue: self.name,
            obs_uuid,
            parent_action,
            remote_parent_id,
            request,
            attempts,
            ignored,
            created_at,
        })
    }

    /// The next item, ignored ones included
    pub fn peek_front(&self, conn: &Connection) -> Result<Option<QueueItem>, AppError> {
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM request_queue WHERE queue = ?1 ORDER BY position, id LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![self.name.as_str()],
                read_raw,
            )
            .optional()?;

        raw.map(|raw| self.to_item(raw)).transpose()
    }

    pub fn items(&self, conn: &Connection) -> Result<Vec<QueueItem>, AppError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM request_queue WHERE queue = ?1 ORDER BY position, id",
            SELECT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![self.name.as_str()], read_raw)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(|raw| self.to_item(raw)).collect()
    }

    pub fn remove(&self, conn: &Connection, id: i64) -> Result<(), AppError> {
        conn.execute("DELETE FROM request_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Counts a failed attempt; the item keeps its position
    pub fn bump_attempts(&self, conn: &Connection, id: i64) -> Result<u32, AppError> {
        conn.execute(
            "UPDATE request_queue SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts = conn
            .query_row(
                "SELECT attempts FROM request_queue WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        attempts.ok_or_else(|| AppError::NotFound(format!("Queue item {}", id)))
    }

    /// Flags every remaining item of `uuid` so the drain skips it
    pub fn ignore_for_parent(&self, conn: &Connection, uuid: &Uuid) -> Result<usize, AppError> {
        let changed = conn.execute(
            "UPDATE request_queue SET ignored = 1 WHERE queue = ?1 AND obs_uuid = ?2 AND ignored = 0",
            params![self.name.as_str(), uuid.to_string()],
        )?;
        if changed > 0 {
            log::info!(
                "Skipping {} queued {} requests for {}",
                changed,
                self.name.as_str(),
                uuid
            );
        }
        Ok(changed)
    }

    /// Live (not ignored) items for `uuid` in this queue
    pub fn count_for(&self, conn: &Connection, uuid: &Uuid) -> Result<usize, AppError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM request_queue WHERE queue = ?1 AND obs_uuid = ?2 AND ignored = 0",
            params![self.name.as_str(), uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn len(&self, conn: &Connection) -> Result<usize, AppError> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM request_queue WHERE queue = ?1",
            params![self.name.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self, conn: &Connection) -> Result<bool, AppError> {
        Ok(self.len(conn)? == 0)
    }
}

/// Live items for `uuid` across both queues
pub fn pending_count_for(conn: &Connection, uuid: &Uuid) -> Result<usize, AppError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM request_queue WHERE obs_uuid = ?1 AND ignored = 0",
        params![uuid.to_string()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Drops every queued item of `uuid`, e.g. when the record is purged
pub fn remove_all_for(conn: &Connection, uuid: &Uuid) -> Result<usize, AppError> {
    Ok(conn.execute(
        "DELETE FROM request_queue WHERE obs_uuid = ?1",
        params![uuid.to_string()],
    )?)
}
