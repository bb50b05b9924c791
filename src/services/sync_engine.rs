//! Entry point for the presentation layer.
//!
//! Save calls only touch the local database and return immediately; the
//! remote side is reached by `sync_now`, usually from the background loop.

use crate::config::SyncConfig;
use crate::database::{migrations, Database};
use crate::error::AppError;
use crate::models::{
    ActionType, NewObservation, ObservationRecord, Outcome, QueueName, QueueStatusRow,
    RecordIdentity, SyncMeta,
};
use crate::services::context::SyncContext;
use crate::services::credentials::CredentialProvider;
use crate::services::edit_strategy::{self, EditRequest, Resolution};
use crate::services::notifier::{Notifier, SyncEvent};
use crate::services::pending_tasks::{self, PendingTaskPoller};
use crate::services::record_store::RecordStore;
use crate::services::request_builder::RequestBuilder;
use crate::services::request_queue::{self, RequestQueue};
use crate::services::transport::RemoteTransport;
use crate::services::uploader::{DrainStop, Uploader};
use crate::services::{completion, remote_cache};
use photo_store::PhotoStoreConfig;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncStats {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Stopped on a transient error; worth retrying soon
    pub deferred: bool,
    pub credentials_stale: bool,
    pub pending_tasks: usize,
}

pub struct SyncEngine {
    ctx: SyncContext,
    uploader: Uploader,
    poller: Arc<PendingTaskPoller>,
    wake: Arc<Notify>,
}

impl SyncEngine {
    pub fn new(
        db: Database,
        config: &SyncConfig,
        transport: Arc<dyn RemoteTransport>,
        builder: Arc<dyn RequestBuilder>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let ctx = SyncContext {
            db,
            store: Arc::new(RecordStore::new(PhotoStoreConfig {
                thumbnail_size: config.thumbnail_size,
            })),
            notifier: Notifier::new(),
            credentials,
            transport,
            builder,
        };
        Self::from_context(ctx, config)
    }

    pub fn from_context(ctx: SyncContext, config: &SyncConfig) -> Self {
        let parent = Arc::new(RequestQueue::new(QueueName::Parent));
        let dependent = Arc::new(RequestQueue::new(QueueName::Dependent));
        let uploader = Uploader::new(
            ctx.clone(),
            parent,
            Arc::clone(&dependent),
            config.project_id,
        );
        let wake = Arc::new(Notify::new());
        let poller = Arc::new(
            PendingTaskPoller::new(
                ctx.clone(),
                dependent,
                Duration::from_secs(config.poll_interval_secs),
            )
            .with_wake(Arc::clone(&wake)),
        );

        Self {
            ctx,
            uploader,
            poller,
            wake,
        }
    }

    pub fn run_migrations(&self) -> Result<Vec<&'static str>, AppError> {
        self.ctx
            .db
            .with_conn(|conn| migrations::run_migrations(conn, &self.ctx.store))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.ctx.notifier.subscribe()
    }

    /// Signalled whenever a save leaves something to upload
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Record with its full photo bytes
    pub fn get(&self, uuid: &Uuid) -> Result<Option<ObservationRecord>, AppError> {
        self.ctx.db.with_conn(|conn| self.ctx.store.get(conn, uuid))
    }

    /// Stores a brand-new observation as a create
    pub fn save_new(&self, new: NewObservation, is_draft: bool) -> Result<Uuid, AppError> {
        let uuid = new.uuid.filter(|u| !u.is_nil()).unwrap_or_else(Uuid::new_v4);
        let outcome = if is_draft {
            Outcome::Draft
        } else {
            Outcome::Waiting
        };

        self.ctx.db.with_tx(|conn| {
            if self.ctx.store.load(conn, &uuid)?.is_some() {
                return Err(AppError::Validation(format!(
                    "Observation {} already exists",
                    uuid
                )));
            }
            let mut meta = SyncMeta::new(ActionType::Create, outcome);
            meta.pending_photo_adds = new.photos;
            let mut body = new.body;
            for field in body.field_values.iter_mut() {
                field.dirty = true;
            }
            self.ctx
                .store
                .put(conn, ObservationRecord::new(uuid, body, meta))
        })?;

        log::info!("Saved new observation {} ({})", uuid, outcome);
        self.ctx.notifier.record_changed(uuid);
        if !is_draft {
            self.wake.notify_one();
        }
        Ok(uuid)
    }

    /// Merges an edit into the record. Returns the remote id once known.
    pub fn save_edit(&self, uuid: Uuid, edit: EditRequest) -> Result<RecordIdentity, AppError> {
        let (identity, upload) = self.ctx.db.with_tx(|conn| {
            let existing = self.ctx.store.load(conn, &uuid)?;
            let remote = remote_cache::get(conn, &uuid)?;
            let has_task = pending_tasks::has(conn, &uuid)?;

            match edit_strategy::resolve(uuid, existing, remote.as_ref(), has_task, edit)? {
                Resolution::Put { record, upload } => {
                    let record = self.ctx.store.put(conn, record)?;
                    let identity = match record.remote_id {
                        Some(id) => RecordIdentity::Remote(id),
                        None => RecordIdentity::Local(uuid),
                    };
                    Ok((identity, upload))
                }
                Resolution::PurgeLocal { uuid } => {
                    self.purge(conn, &uuid)?;
                    Ok((RecordIdentity::Local(uuid), false))
                }
            }
        })?;

        self.ctx.notifier.record_changed(uuid);
        if upload {
            self.wake.notify_one();
        }
        Ok(identity)
    }

    pub fn delete_record(&self, uuid: Uuid) -> Result<(), AppError> {
        self.save_edit(uuid, EditRequest::delete()).map(|_| ())
    }

    fn purge(&self, conn: &Connection, uuid: &Uuid) -> Result<(), AppError> {
        if request_queue::pending_count_for(conn, uuid)? > 0 {
            return Err(AppError::Validation(format!(
                "Observation {} still has requests in flight",
                uuid
            )));
        }
        completion::finish_delete(&self.ctx, conn, uuid)
    }

    /// `draft -> waiting` for the record or its blocked action
    pub fn finalize_draft(&self, uuid: Uuid) -> Result<(), AppError> {
        self.ctx.db.with_tx(|conn| {
            self.ctx.store.update(conn, &uuid, |record| {
                if record.meta.outcome == Outcome::Draft {
                    return record.meta.set_outcome(Outcome::Waiting);
                }
                match record.meta.blocked_action.as_mut() {
                    Some(blocked) if blocked.outcome == Outcome::Draft => {
                        blocked.outcome = Outcome::Waiting;
                        Ok(())
                    }
                    _ => Err(AppError::Validation(format!(
                        "Observation {} is not a draft",
                        uuid
                    ))),
                }
            })
        })?;

        self.ctx.notifier.record_changed(uuid);
        self.wake.notify_one();
        Ok(())
    }

    pub fn get_local_queue_summary(&self) -> Result<Vec<QueueStatusRow>, AppError> {
        self.ctx.db.with_conn(|conn| {
            let mut rows = Vec::new();
            self.ctx.store.for_each(conn, |record| {
                let possibly_stuck = record.meta.outcome == Outcome::BeingProcessed
                    && !pending_tasks::has(conn, &record.uuid)?
                    && request_queue::pending_count_for(conn, &record.uuid)? == 0;
                rows.push(QueueStatusRow {
                    uuid: record.uuid,
                    outcome: record.meta.outcome,
                    action_type: record.meta.action_type,
                    has_blocked_action: record.meta.blocked_action.is_some(),
                    possibly_stuck,
                });
                Ok(())
            })?;
            Ok(rows)
        })
    }

    /// Queues a failed or stalled record again
    pub fn retry(&self, uuid: Uuid) -> Result<(), AppError> {
        self.ctx.db.with_tx(|conn| self.retry_in(conn, &uuid))?;
        self.ctx.notifier.record_changed(uuid);
        self.wake.notify_one();
        Ok(())
    }

    fn retry_in(&self, conn: &Connection, uuid: &Uuid) -> Result<(), AppError> {
        if request_queue::pending_count_for(conn, uuid)? > 0 {
            return Err(AppError::Validation(format!(
                "Observation {} still has requests in flight",
                uuid
            )));
        }
        self.ctx.store.update(conn, uuid, |record| {
            if record.meta.outcome == Outcome::BeingProcessed {
                return Err(AppError::Validation(format!(
                    "Observation {} is being processed",
                    uuid
                )));
            }
            edit_strategy::fold_blocked_action(record);
            record.meta.last_error = None;
            record.meta.set_outcome(Outcome::Waiting)
        })?;
        log::info!("Retrying observation {}", uuid);
        Ok(())
    }

    /// Retries every failed delete, or every failed create and update
    pub fn retry_all(&self, failed_deletes: bool) -> Result<usize, AppError> {
        let failed = self
            .ctx
            .db
            .with_conn(|conn| self.ctx.store.list_failed(conn, None))?;

        let mut retried = 0;
        for record in failed
            .into_iter()
            .filter(|r| (r.meta.action_type == ActionType::Delete) == failed_deletes)
        {
            match self.ctx.db.with_tx(|conn| self.retry_in(conn, &record.uuid)) {
                Ok(()) => {
                    retried += 1;
                    self.ctx.notifier.record_changed(record.uuid);
                }
                Err(e) => log::warn!("Cannot retry {}: {}", record.uuid, e),
            }
        }

        if retried > 0 {
            self.wake.notify_one();
        }
        Ok(retried)
    }

    /// One full cycle: claim waiting records, drain both queues, make sure
    /// pending tasks are being polled.
    pub async fn sync_now(&self) -> Result<SyncStats, AppError> {
        let mut stats = SyncStats {
            claimed: self.uploader.claim_waiting()?,
            ..Default::default()
        };

        // Second parent pass picks up rollbacks queued by dependent failures
        for name in [QueueName::Parent, QueueName::Dependent, QueueName::Parent] {
            let report = self.uploader.drain(name).await?;
            stats.sent += report.sent + report.local;
            stats.failed += report.failed;
            stats.skipped += report.skipped;
            match report.stop {
                Some(DrainStop::Credentials) => {
                    stats.credentials_stale = true;
                    break;
                }
                Some(DrainStop::Transient) => {
                    stats.deferred = true;
                    break;
                }
                None => {}
            }
        }

        stats.pending_tasks = self.ctx.db.with_conn(pending_tasks::list)?.len();
        if stats.pending_tasks > 0 {
            self.poller.ensure_running();
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        ObservationBody, ObservationPatch, PendingPhotoAdd, PhotoBlobRef, PhotoRole,
    };
    use crate::services::testing::{sample_jpeg, test_context, ScriptedTransport};
    use crate::services::transport::RemoteResponse;
    use photo_store::{PhotoBlob, PhotoRecord, PhotoVariant};
    use serde_json::json;

    fn engine() -> (SyncEngine, Arc<ScriptedTransport>) {
        let transport = ScriptedTransport::new();
        let (ctx, _credentials) = test_context(transport.clone());
        (SyncEngine::from_context(ctx, &SyncConfig::default()), transport)
    }

    fn new_with_photo(uuid: Uuid) -> NewObservation {
        NewObservation {
            uuid: Some(uuid),
            body: ObservationBody {
                caption: Some("first".into()),
                ..Default::default()
            },
            photos: vec![PendingPhotoAdd::new(
                "P1",
                PhotoBlob::new(vec![10, 20, 30], "image/jpeg"),
                PhotoRole::Primary,
            )],
        }
    }

    fn caption(text: &str) -> EditRequest {
        EditRequest {
            patch: ObservationPatch {
                caption: Some(text.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_save_new_and_get_returns_photo_bytes() {
        let (engine, _) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();

        let record = engine.get(&uuid).unwrap().unwrap();
        assert_eq!(record.meta.outcome, Outcome::Waiting);
        match &record.meta.pending_photo_adds[0].blob {
            Some(PhotoBlobRef::Inline { blob }) => assert_eq!(blob.bytes, vec![10, 20, 30]),
            other => panic!("unexpected blob {:?}", other),
        }

        assert!(matches!(
            engine.save_new(new_with_photo(uuid), false),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_caption_edit_while_processing_lands_in_blocked_action() {
        let (engine, _) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();
        engine
            .ctx
            .db
            .with_conn(|conn| engine.ctx.store.set_outcome(conn, &uuid, Outcome::BeingProcessed))
            .unwrap();

        let identity = engine.save_edit(uuid, caption("changed")).unwrap();

        assert_eq!(identity, RecordIdentity::Local(uuid));
        let record = engine.get(&uuid).unwrap().unwrap();
        assert_eq!(record.body.caption.as_deref(), Some("first"));
        assert_eq!(record.meta.outcome, Outcome::BeingProcessed);
        assert_eq!(
            record.meta.blocked_action.unwrap().patch.caption.as_deref(),
            Some("changed")
        );
    }

    #[test]
    fn test_failed_resolution_writes_nothing() {
        let (engine, _) = engine();
        let result = engine.save_edit(Uuid::new_v4(), caption("x"));
        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert!(engine.get_local_queue_summary().unwrap().is_empty());
    }

    #[test]
    fn test_delete_of_unsent_record_removes_it_and_its_photos() {
        let (engine, _) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();

        engine.delete_record(uuid).unwrap();

        assert!(engine.get(&uuid).unwrap().is_none());
        let photos = engine
            .ctx
            .db
            .with_conn(|conn| Ok(engine.ctx.store.photo_store().list_ids(conn)?))
            .unwrap();
        assert!(photos.is_empty());
    }

    #[test]
    fn test_finalize_draft() {
        let (engine, _) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), true).unwrap();
        assert_eq!(engine.get(&uuid).unwrap().unwrap().meta.outcome, Outcome::Draft);

        engine.finalize_draft(uuid).unwrap();
        assert_eq!(engine.get(&uuid).unwrap().unwrap().meta.outcome, Outcome::Waiting);
        assert!(matches!(
            engine.finalize_draft(uuid),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_summary_flags_possibly_stuck() {
        let (engine, _) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();
        engine
            .ctx
            .db
            .with_conn(|conn| engine.ctx.store.set_outcome(conn, &uuid, Outcome::BeingProcessed))
            .unwrap();

        let rows = engine.get_local_queue_summary().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].possibly_stuck);
        assert_eq!(rows[0].action_type, ActionType::Create);
    }

    #[tokio::test]
    async fn test_sync_now_uploads_and_returns_remote_id() {
        let (engine, transport) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();

        let stats = engine.sync_now().await.unwrap();

        assert_eq!(stats.claimed, 1);
        assert!(!stats.deferred);
        assert_eq!(transport.sent_paths(), vec!["/observations", "/observation_photos"]);
        let record = engine.get(&uuid).unwrap().unwrap();
        assert_eq!(record.meta.outcome, Outcome::Success);

        let identity = engine.save_edit(uuid, caption("after sync")).unwrap();
        assert_eq!(identity, RecordIdentity::Remote(1001));
        assert_eq!(
            engine.get(&uuid).unwrap().unwrap().meta.action_type,
            ActionType::Update
        );
    }

    #[tokio::test]
    async fn test_sync_replaces_uploaded_photo_with_thumbnail_once() {
        let (engine, _) = engine();
        let original = sample_jpeg(640, 480);
        let mut new = new_with_photo(Uuid::new_v4());
        new.photos[0] = PendingPhotoAdd::new(
            "P1",
            PhotoBlob::new(original.clone(), "image/jpeg"),
            PhotoRole::Primary,
        );
        let uuid = engine.save_new(new, false).unwrap();

        let stored = |engine: &SyncEngine| -> PhotoRecord {
            engine
                .ctx
                .db
                .with_conn(|conn| Ok(engine.ctx.store.photo_store().get_photo(conn, "P1")?))
                .unwrap()
                .unwrap()
        };
        assert_eq!(stored(&engine).variant, PhotoVariant::Original);

        engine.sync_now().await.unwrap();
        let thumb = stored(&engine);
        assert_eq!(engine.get(&uuid).unwrap().unwrap().meta.outcome, Outcome::Success);
        assert_eq!(thumb.variant, PhotoVariant::Thumbnail);
        assert!(thumb.blob.bytes.len() < original.len());

        engine.save_edit(uuid, caption("second pass")).unwrap();
        engine.sync_now().await.unwrap();
        assert_eq!(engine.get(&uuid).unwrap().unwrap().meta.outcome, Outcome::Success);
        assert_eq!(stored(&engine), thumb);
    }

    #[tokio::test]
    async fn test_retry_all_after_server_rejection() {
        let (engine, transport) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();
        transport.push(Ok(RemoteResponse::new(400, json!({"error": "bad"}))));

        engine.sync_now().await.unwrap();
        assert_eq!(
            engine.get(&uuid).unwrap().unwrap().meta.outcome,
            Outcome::SystemError
        );

        assert_eq!(engine.retry_all(true).unwrap(), 0);
        assert_eq!(engine.retry_all(false).unwrap(), 1);
        assert_eq!(engine.get(&uuid).unwrap().unwrap().meta.outcome, Outcome::Waiting);

        engine.sync_now().await.unwrap();
        assert_eq!(engine.get(&uuid).unwrap().unwrap().meta.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_rejected_photo_rolls_back_and_retry_recreates() {
        let (engine, transport) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();
        transport.push(Ok(RemoteResponse::new(201, json!({"id": 70}))));
        transport.push(Ok(RemoteResponse::new(422, json!({"error": "unreadable"}))));

        let stats = engine.sync_now().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(
            transport.sent_paths(),
            vec!["/observations", "/observation_photos", "/observations/70"]
        );
        let record = engine.get(&uuid).unwrap().unwrap();
        assert_eq!(record.meta.outcome, Outcome::SystemError);
        assert_eq!(record.remote_id, None);

        engine.retry(uuid).unwrap();
        engine.sync_now().await.unwrap();
        let record = engine.get(&uuid).unwrap().unwrap();
        assert_eq!(record.meta.outcome, Outcome::Success);
        assert_eq!(record.meta.action_type, ActionType::Create);
    }

    #[tokio::test]
    async fn test_retry_refuses_in_flight_record() {
        let (engine, transport) = engine();
        let uuid = engine.save_new(new_with_photo(Uuid::new_v4()), false).unwrap();
        transport.push_status(503);

        let stats = engine.sync_now().await.unwrap();
        assert!(stats.deferred);
        assert!(matches!(engine.retry(uuid), Err(AppError::Validation(_))));
    }
}
