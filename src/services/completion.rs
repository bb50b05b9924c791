//! What happens to a record when its requests come back: dependent bundle
//! bookkeeping, success, failure and rollback.

use crate::error::AppError;
use crate::models::{
    ActionType, DependentRequestBundle, NewQueueItem, ObservationRecord, Outcome, PendingPhotoAdd,
    PhotoBlobRef, PhotoUpload, QueuedRequest, TerminalRequest,
};
use crate::services::context::SyncContext;
use crate::services::edit_strategy::promote_blocked_action;
use crate::services::request_queue::{self, RequestQueue};
use crate::services::{pending_tasks, remote_cache};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Everything that must follow the parent request of `record`
pub fn build_bundle(
    record: &ObservationRecord,
    parent_action: ActionType,
    project_id: Option<i64>,
) -> DependentRequestBundle {
    let meta = &record.meta;
    let photo_uploads = meta
        .pending_photo_adds
        .iter()
        .filter(|add| add.blob.is_some())
        .map(|add| PhotoUpload {
            local_id: add.local_id.clone(),
            role: add.role,
        })
        .collect();

    let (photo_deletes, field_deletes, terminal) = match parent_action {
        ActionType::Create => (
            Vec::new(),
            Vec::new(),
            project_id
                .map(|project_id| TerminalRequest::LinkToProject { project_id })
                .unwrap_or(TerminalRequest::BundleComplete),
        ),
        _ => (
            meta.pending_photo_deletes.clone(),
            meta.pending_field_deletes.clone(),
            TerminalRequest::BundleComplete,
        ),
    };

    DependentRequestBundle {
        obs_uuid: record.uuid,
        parent_action,
        remote_parent_id: record.remote_id,
        photo_uploads,
        field_values: record.dirty_field_values(),
        photo_deletes,
        field_deletes,
        terminal,
        created_at: Utc::now(),
    }
}

pub fn save_bundle(conn: &Connection, bundle: &DependentRequestBundle) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO dependent_bundles (obs_uuid, payload) VALUES (?1, ?2)
         ON CONFLICT(obs_uuid) DO UPDATE SET payload = excluded.payload",
        params![bundle.obs_uuid.to_string(), serde_json::to_string(bundle)?],
    )?;
    Ok(())
}

/// Removes and returns the bundle of `uuid`
pub fn take_bundle(
    conn: &Connection,
    uuid: &Uuid,
) -> Result<Option<DependentRequestBundle>, AppError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT payload FROM dependent_bundles WHERE obs_uuid = ?1",
            params![uuid.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    discard_bundle(conn, uuid)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn discard_bundle(conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
    let removed = conn.execute(
        "DELETE FROM dependent_bundles WHERE obs_uuid = ?1",
        params![uuid.to_string()],
    )?;
    Ok(removed > 0)
}

/// The parent request was accepted: generate its dependent requests.
///
/// The bundle is consumed here, not when its requests succeed.
pub fn parent_accepted(
    ctx: &SyncContext,
    conn: &Connection,
    dependent: &RequestQueue,
    uuid: &Uuid,
    remote_id: i64,
) -> Result<(), AppError> {
    let bundle = take_bundle(conn, uuid)?
        .ok_or_else(|| AppError::Consistency(format!("Missing dependent bundle for {}", uuid)))?;

    if let Some(mut record) = ctx.store.load(conn, uuid)? {
        if record.remote_id != Some(remote_id) {
            record.remote_id = Some(remote_id);
            ctx.store.put(conn, record)?;
        }
    }

    let action = bundle.parent_action;
    let queue = |request| {
        dependent.push_back(
            conn,
            NewQueueItem::new(*uuid, action, Some(remote_id), request),
        )
    };

    for upload in bundle.photo_uploads {
        queue(QueuedRequest::UploadPhoto {
            local_id: upload.local_id,
            role: upload.role,
        })?;
    }
    for field in bundle.field_values {
        queue(QueuedRequest::UpsertFieldValue { field })?;
    }
    for remote_photo_id in bundle.photo_deletes {
        queue(QueuedRequest::DeletePhoto { remote_photo_id })?;
    }
    for remote_field_id in bundle.field_deletes {
        queue(QueuedRequest::DeleteFieldValue { remote_field_id })?;
    }
    queue(match bundle.terminal {
        TerminalRequest::LinkToProject { project_id } => {
            QueuedRequest::LinkToProject { project_id }
        }
        TerminalRequest::BundleComplete => QueuedRequest::BundleComplete,
    })?;

    log::debug!("Parent of {} accepted as {}, dependents queued", uuid, remote_id);
    ctx.notifier.record_changed(*uuid);
    Ok(())
}

/// Every request of the in-flight action is done
pub fn finish_success(ctx: &SyncContext, conn: &Connection, uuid: &Uuid) -> Result<(), AppError> {
    let Some(mut record) = ctx.store.load(conn, uuid)? else {
        return Ok(());
    };
    if pending_tasks::has(conn, uuid)? {
        log::debug!("{} still has a pending task, not completing", uuid);
        return Ok(());
    }
    if record.meta.outcome != Outcome::BeingProcessed {
        log::debug!("{} is {}, not completing", uuid, record.meta.outcome);
        return Ok(());
    }

    record.meta.set_outcome(Outcome::Success)?;
    record.meta.last_error = None;
    record.meta.pending_photo_adds.clear();
    record.meta.pending_photo_deletes.clear();
    record.meta.pending_field_deletes.clear();

    // Full-size bytes are no longer needed once the remote has them
    for photo in record.photos.iter().filter(|p| p.remote_id.is_some()) {
        if let Some(local_id) = &photo.local_id {
            if let Err(e) = ctx.store.photo_store().replace_with_thumbnail(conn, local_id) {
                log::warn!("Keeping full photo {}: {}", local_id, e);
            }
        }
    }

    if promote_blocked_action(&mut record)? {
        log::info!("Blocked action of {} is now queued", uuid);
    }
    ctx.store.put(conn, record)?;
    log::info!("Observation {} synced", uuid);
    ctx.notifier.record_changed(*uuid);
    Ok(())
}

/// The remote no longer has the observation; forget it locally
pub fn finish_delete(ctx: &SyncContext, conn: &Connection, uuid: &Uuid) -> Result<(), AppError> {
    ctx.store.delete(conn, uuid)?;
    remote_cache::remove(conn, uuid)?;
    pending_tasks::remove(conn, uuid)?;
    request_queue::remove_all_for(conn, uuid)?;
    discard_bundle(conn, uuid)?;
    log::info!("Observation {} removed", uuid);
    ctx.notifier.record_changed(*uuid);
    Ok(())
}

/// Marks the in-flight action of `uuid` as failed and tells observers
pub fn fail_record(
    ctx: &SyncContext,
    conn: &Connection,
    uuid: &Uuid,
    outcome: Outcome,
    message: &str,
) -> Result<(), AppError> {
    let Some(mut record) = ctx.store.load(conn, uuid)? else {
        log::warn!("Failure for unknown observation {}: {}", uuid, message);
        return Ok(());
    };

    if record.meta.outcome == Outcome::BeingProcessed {
        record.meta.set_outcome(outcome)?;
    }
    record.meta.last_error = Some(message.to_string());
    ctx.store.put(conn, record)?;
    ctx.notifier.record_changed(*uuid);
    ctx.notifier.monitoring(*uuid, message);
    Ok(())
}

/// The remote copy of a failed create was deleted. Everything that had been
/// sent is queued again so a retry recreates it from scratch.
pub fn rollback_done(ctx: &SyncContext, conn: &Connection, uuid: &Uuid) -> Result<(), AppError> {
    remote_cache::remove(conn, uuid)?;
    let Some(mut record) = ctx.store.load(conn, uuid)? else {
        return Ok(());
    };

    record.remote_id = None;
    record.meta.action_type = ActionType::Create;
    let (sent, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut record.photos)
        .into_iter()
        .partition(|p| p.remote_id.is_some());
    record.photos = kept;
    for photo in sent {
        if let Some(local_id) = photo.local_id {
            record.meta.pending_photo_adds.push(PendingPhotoAdd {
                local_id,
                blob: Some(PhotoBlobRef::Stored),
                role: photo.role,
            });
        }
    }
    for field in record.body.field_values.iter_mut() {
        field.remote_id = None;
        field.dirty = true;
    }

    ctx.store.put(conn, record)?;
    log::info!("Rolled back remote create of {}", uuid);
    ctx.notifier.record_changed(*uuid);
    Ok(())
}
