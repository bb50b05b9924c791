//! Claims waiting records and drains the parent and dependent queues.
//!
//! A child request is only queued after its parent was accepted, so a
//! strictly ordered drain keeps children behind their parents.

use crate::error::AppError;
use crate::models::{
    ActionType, FieldValue, NewQueueItem, Outcome, PendingTask, PhotoRef, QueueItem, QueueName,
    QueuedRequest,
};
use crate::services::completion;
use crate::services::context::SyncContext;
use crate::services::notifier::SyncEvent;
use crate::services::pending_tasks;
use crate::services::remote_cache::{self, RemoteObservation};
use crate::services::request_queue::{self, RequestQueue};
use crate::services::transport::{classify, RemoteRequest, RemoteResponse};
use rusqlite::Connection;
use std::sync::Arc;
use uuid::Uuid;

/// Why a drain pass stopped before the queue was empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    /// 401 or no credential; the item stays at the front
    Credentials,
    /// 5xx or network failure; the item stays at the front
    Transient,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub sent: usize,
    pub local: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stop: Option<DrainStop>,
    /// Another pass held the queue; this call did nothing
    pub already_running: bool,
}

pub struct Uploader {
    ctx: SyncContext,
    parent: Arc<RequestQueue>,
    dependent: Arc<RequestQueue>,
    project_id: Option<i64>,
}

impl Uploader {
    pub fn new(
        ctx: SyncContext,
        parent: Arc<RequestQueue>,
        dependent: Arc<RequestQueue>,
        project_id: Option<i64>,
    ) -> Self {
        Self {
            ctx,
            parent,
            dependent,
            project_id,
        }
    }

    fn queue(&self, name: QueueName) -> &RequestQueue {
        match name {
            QueueName::Parent => &self.parent,
            QueueName::Dependent => &self.dependent,
        }
    }

    /// Moves every `waiting` record to `beingProcessed` and queues its parent
    /// request. Returns how many records were claimed.
    pub fn claim_waiting(&self) -> Result<usize, AppError> {
        let waiting = self
            .ctx
            .db
            .with_conn(|conn| self.ctx.store.list_by_outcome(conn, Outcome::Waiting))?;

        let mut claimed = 0;
        for record in waiting {
            let uuid = record.uuid;
            match self.ctx.db.with_tx(|conn| self.claim(conn, &uuid)) {
                Ok(true) => claimed += 1,
                Ok(false) => {}
                Err(e @ (AppError::Database(_) | AppError::Photo(_))) => return Err(e),
                Err(e) => {
                    log::error!("Cannot start sync of {}: {}", uuid, e);
                    self.ctx.db.with_tx(|conn| {
                        self.ctx.store.set_outcome(conn, &uuid, Outcome::BeingProcessed)?;
                        completion::fail_record(
                            &self.ctx,
                            conn,
                            &uuid,
                            Outcome::SystemError,
                            &e.to_string(),
                        )
                    })?;
                }
            }
        }

        if claimed > 0 {
            log::info!("Claimed {} waiting observations", claimed);
        }
        Ok(claimed)
    }

    fn claim(&self, conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
        let Some(mut record) = self.ctx.store.load(conn, uuid)? else {
            return Ok(false);
        };
        if record.meta.outcome != Outcome::Waiting {
            return Ok(false);
        }
        if request_queue::pending_count_for(conn, uuid)? > 0 {
            log::debug!("{} still has queued requests, not claiming yet", uuid);
            return Ok(false);
        }

        let (parent_action, request) = match (record.meta.action_type, record.remote_id) {
            (ActionType::Create, None) => (ActionType::Create, QueuedRequest::CreateObservation),
            // A create whose rollback never went through
            (ActionType::Create, Some(remote_id)) | (ActionType::Update, Some(remote_id)) => {
                (ActionType::Update, QueuedRequest::UpdateObservation { remote_id })
            }
            (ActionType::Update, None) => {
                return Err(AppError::Validation(format!(
                    "Update of {} has no remote id",
                    uuid
                )))
            }
            (ActionType::Delete, Some(remote_id)) => {
                (ActionType::Delete, QueuedRequest::DeleteObservation { remote_id })
            }
            (ActionType::Delete, None) => {
                completion::finish_delete(&self.ctx, conn, uuid)?;
                return Ok(true);
            }
        };

        if parent_action != ActionType::Delete {
            let bundle = completion::build_bundle(&record, parent_action, self.project_id);
            completion::save_bundle(conn, &bundle)?;
        }
        self.parent.push_back(
            conn,
            NewQueueItem::new(*uuid, parent_action, record.remote_id, request),
        )?;

        record.meta.action_type = parent_action;
        record.meta.set_outcome(Outcome::BeingProcessed)?;
        self.ctx.store.put(conn, record)?;
        self.ctx.notifier.record_changed(*uuid);
        Ok(true)
    }

    /// Runs the single drain pass of one queue
    pub async fn drain(&self, name: QueueName) -> Result<DrainReport, AppError> {
        let queue = self.queue(name);
        let Some(guard) = queue.try_begin_drain() else {
            return Ok(DrainReport {
                already_running: true,
                ..Default::default()
            });
        };

        let mut report = DrainReport::default();
        loop {
            let stop = self.drain_pass(queue, &mut report).await?;
            report.stop = stop;
            if stop.is_some() || !guard.take_rerun() {
                break;
            }
        }

        let touched = report.sent + report.local + report.skipped + report.failed;
        if touched > 0 || report.stop.is_some() {
            log::info!("Drained {} queue: {:?}", name.as_str(), report);
        }
        Ok(report)
    }

    async fn drain_pass(
        &self,
        queue: &RequestQueue,
        report: &mut DrainReport,
    ) -> Result<Option<DrainStop>, AppError> {
        loop {
            let Some(item) = self.ctx.db.with_conn(|conn| queue.peek_front(conn))? else {
                return Ok(None);
            };

            if item.ignored {
                self.ctx.db.with_conn(|conn| queue.remove(conn, item.id))?;
                report.skipped += 1;
                continue;
            }

            if item.request.is_local_only() {
                self.settle(queue, &item, Ok(None))?;
                report.local += 1;
                continue;
            }

            let Some(credential) = self.ctx.credentials.current() else {
                log::warn!("No credential, pausing {} queue", queue.name().as_str());
                self.ctx.notifier.send(SyncEvent::CredentialsStale);
                return Ok(Some(DrainStop::Credentials));
            };

            let request = match self.ctx.db.with_conn(|conn| self.build_request(conn, &item)) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    log::debug!("Dropping {} for vanished {}", item.request.label(), item.obs_uuid);
                    self.ctx.db.with_conn(|conn| queue.remove(conn, item.id))?;
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    self.settle(queue, &item, Err(e))?;
                    report.failed += 1;
                    continue;
                }
            };

            let result = self
                .ctx
                .transport
                .execute(request, &credential)
                .await
                .and_then(classify);

            match result {
                Ok(response) => {
                    self.settle(queue, &item, Ok(Some(response)))?;
                    report.sent += 1;
                }
                Err(AppError::Auth) => {
                    log::warn!("Credentials rejected, pausing {} queue", queue.name().as_str());
                    self.ctx.notifier.send(SyncEvent::CredentialsStale);
                    return Ok(Some(DrainStop::Credentials));
                }
                Err(e) if e.is_transient() => {
                    let attempts = self
                        .ctx
                        .db
                        .with_conn(|conn| queue.bump_attempts(conn, item.id))?;
                    log::warn!(
                        "{} for {} failed (attempt {}): {}",
                        item.request.label(),
                        item.obs_uuid,
                        attempts,
                        e
                    );
                    return Ok(Some(DrainStop::Transient));
                }
                Err(AppError::Client { status: 404, .. }) if is_delete(&item.request) => {
                    log::debug!("{} for {} already gone", item.request.label(), item.obs_uuid);
                    self.settle(queue, &item, Ok(None))?;
                    report.sent += 1;
                }
                Err(e) => {
                    self.settle(queue, &item, Err(e))?;
                    report.failed += 1;
                }
            }
        }
    }

    /// Applies the outcome of one item and removes it from its queue
    fn settle(
        &self,
        queue: &RequestQueue,
        item: &QueueItem,
        result: Result<Option<RemoteResponse>, AppError>,
    ) -> Result<(), AppError> {
        let applied = self.ctx.db.with_tx(|conn| {
            match &result {
                Ok(response) => self.on_success(conn, item, response.as_ref())?,
                Err(e) => self.on_failure(conn, item, e)?,
            }
            queue.remove(conn, item.id)
        });

        match applied {
            Ok(()) => Ok(()),
            Err(e @ AppError::Database(_)) => Err(e),
            Err(e) => {
                log::error!(
                    "Cannot apply result of {} for {}: {}",
                    item.request.label(),
                    item.obs_uuid,
                    e
                );
                self.ctx.db.with_tx(|conn| {
                    completion::discard_bundle(conn, &item.obs_uuid)?;
                    self.dependent.ignore_for_parent(conn, &item.obs_uuid)?;
                    completion::fail_record(
                        &self.ctx,
                        conn,
                        &item.obs_uuid,
                        Outcome::SystemError,
                        &e.to_string(),
                    )?;
                    queue.remove(conn, item.id)
                })
            }
        }
    }

    fn build_request(
        &self,
        conn: &Connection,
        item: &QueueItem,
    ) -> Result<Option<RemoteRequest>, AppError> {
        let builder = &self.ctx.builder;
        let parent_id = || {
            item.remote_parent_id.ok_or_else(|| {
                AppError::Consistency(format!(
                    "{} for {} has no parent id",
                    item.request.label(),
                    item.obs_uuid
                ))
            })
        };

        let request = match &item.request {
            QueuedRequest::CreateObservation => match self.ctx.store.load(conn, &item.obs_uuid)? {
                Some(record) => builder.create_observation(&record),
                None => return Ok(None),
            },
            QueuedRequest::UpdateObservation { remote_id } => {
                match self.ctx.store.load(conn, &item.obs_uuid)? {
                    Some(record) => builder.update_observation(&record, *remote_id),
                    None => return Ok(None),
                }
            }
            QueuedRequest::DeleteObservation { remote_id }
            | QueuedRequest::RollbackCreate { remote_id } => builder.delete_observation(*remote_id),
            QueuedRequest::UploadPhoto { local_id, role } => {
                let photo = self
                    .ctx
                    .store
                    .photo_store()
                    .get_photo(conn, local_id)?
                    .ok_or_else(|| {
                        AppError::Consistency(format!("Photo {} is missing", local_id))
                    })?;
                builder.upload_photo(parent_id()?, local_id, *role, photo.blob)
            }
            QueuedRequest::DeletePhoto { remote_photo_id } => {
                builder.delete_photo(*remote_photo_id)
            }
            QueuedRequest::UpsertFieldValue { field } => {
                builder.upsert_field_value(parent_id()?, field)
            }
            QueuedRequest::DeleteFieldValue { remote_field_id } => {
                builder.delete_field_value(*remote_field_id)
            }
            QueuedRequest::LinkToProject { project_id } => {
                builder.link_to_project(parent_id()?, *project_id)
            }
            QueuedRequest::BundleComplete => {
                return Err(AppError::Consistency(
                    "Bundle marker has no remote request".to_string(),
                ))
            }
        };
        Ok(Some(request))
    }

    fn on_success(
        &self,
        conn: &Connection,
        item: &QueueItem,
        response: Option<&RemoteResponse>,
    ) -> Result<(), AppError> {
        let uuid = &item.obs_uuid;

        if let Some(handle) = response.and_then(RemoteResponse::status_url) {
            if item.queue == QueueName::Parent {
                pending_tasks::add(conn, PendingTask::new(*uuid, item.parent_action, handle))?;
                log::info!("{} of {} accepted for later processing", item.request.label(), uuid);
                return Ok(());
            }
        }

        match &item.request {
            QueuedRequest::CreateObservation => {
                let response = response.ok_or_else(|| {
                    AppError::Consistency("Create finished without a response".to_string())
                })?;
                let remote_id = response.remote_id().ok_or_else(|| {
                    AppError::Validation(format!("Create of {} returned no id", uuid))
                })?;
                self.cache_echo(conn, uuid, response)?;
                completion::parent_accepted(&self.ctx, conn, &self.dependent, uuid, remote_id)
            }
            QueuedRequest::UpdateObservation { remote_id } => {
                if let Some(response) = response {
                    self.cache_echo(conn, uuid, response)?;
                }
                completion::parent_accepted(&self.ctx, conn, &self.dependent, uuid, *remote_id)
            }
            QueuedRequest::DeleteObservation { .. } => {
                completion::finish_delete(&self.ctx, conn, uuid)
            }
            QueuedRequest::RollbackCreate { .. } => {
                completion::rollback_done(&self.ctx, conn, uuid)
            }
            QueuedRequest::UploadPhoto { local_id, role } => {
                let remote_id = response.and_then(RemoteResponse::remote_id);
                self.update_record(conn, uuid, |record| {
                    record.meta.pending_photo_adds.retain(|a| &a.local_id != local_id);
                    record.photos.push(PhotoRef {
                        local_id: Some(local_id.clone()),
                        remote_id,
                        role: *role,
                    });
                })
            }
            QueuedRequest::DeletePhoto { remote_photo_id } => {
                let mut released = Vec::new();
                self.update_record(conn, uuid, |record| {
                    record.meta.pending_photo_deletes.retain(|id| id != remote_photo_id);
                    record.photos.retain(|p| {
                        if p.remote_id == Some(*remote_photo_id) {
                            released.extend(p.local_id.clone());
                            false
                        } else {
                            true
                        }
                    });
                })?;
                for local_id in released {
                    self.ctx.store.photo_store().delete_photo(conn, &local_id)?;
                }
                Ok(())
            }
            QueuedRequest::UpsertFieldValue { field } => {
                let remote_id = response.and_then(RemoteResponse::remote_id);
                self.update_record(conn, uuid, |record| {
                    mark_field_sent(&mut record.body.field_values, field, remote_id)
                })
            }
            QueuedRequest::DeleteFieldValue { remote_field_id } => {
                self.update_record(conn, uuid, |record| {
                    record.meta.pending_field_deletes.retain(|id| id != remote_field_id);
                    record
                        .body
                        .field_values
                        .retain(|f| f.remote_id != Some(*remote_field_id));
                })
            }
            QueuedRequest::LinkToProject { .. } | QueuedRequest::BundleComplete => {
                completion::finish_success(&self.ctx, conn, uuid)
            }
        }
    }

    fn on_failure(
        &self,
        conn: &Connection,
        item: &QueueItem,
        error: &AppError,
    ) -> Result<(), AppError> {
        let uuid = &item.obs_uuid;
        let message = match error {
            AppError::Client { message, .. } => message.clone(),
            other => other.to_string(),
        };
        log::warn!("{} for {} rejected: {}", item.request.label(), uuid, message);

        match item.queue {
            QueueName::Parent => {
                if let QueuedRequest::RollbackCreate { remote_id } = item.request {
                    self.ctx.notifier.monitoring(
                        *uuid,
                        format!("Rollback of remote observation {} failed: {}", remote_id, message),
                    );
                    return Ok(());
                }
                completion::discard_bundle(conn, uuid)?;
                let outcome = match error {
                    AppError::Client { status: 422, .. } => Outcome::UserError,
                    _ => Outcome::SystemError,
                };
                completion::fail_record(&self.ctx, conn, uuid, outcome, &message)
            }
            QueueName::Dependent => {
                self.dependent.ignore_for_parent(conn, uuid)?;
                if item.parent_action == ActionType::Create {
                    if let Some(remote_id) = item.remote_parent_id {
                        self.parent.push_front(
                            conn,
                            NewQueueItem::new(
                                *uuid,
                                ActionType::Create,
                                Some(remote_id),
                                QueuedRequest::RollbackCreate { remote_id },
                            ),
                        )?;
                        log::info!(
                            "Queued rollback of remote observation {} for {}",
                            remote_id,
                            uuid
                        );
                    }
                }
                completion::fail_record(&self.ctx, conn, uuid, Outcome::SystemError, &message)
            }
        }
    }

    fn cache_echo(
        &self,
        conn: &Connection,
        uuid: &Uuid,
        response: &RemoteResponse,
    ) -> Result<(), AppError> {
        let echo = response.body.get("observation").unwrap_or(&response.body);
        if let Some(remote) = RemoteObservation::from_echo(echo) {
            remote_cache::upsert(conn, *uuid, remote)?;
        }
        Ok(())
    }

    /// Edits a stored record in place; a record deleted meanwhile is ignored
    fn update_record(
        &self,
        conn: &Connection,
        uuid: &Uuid,
        f: impl FnOnce(&mut crate::models::ObservationRecord),
    ) -> Result<(), AppError> {
        let Some(mut record) = self.ctx.store.load(conn, uuid)? else {
            return Ok(());
        };
        f(&mut record);
        self.ctx.store.put(conn, record)?;
        Ok(())
    }
}

fn is_delete(request: &QueuedRequest) -> bool {
    matches!(
        request,
        QueuedRequest::DeleteObservation { .. }
            | QueuedRequest::RollbackCreate { .. }
            | QueuedRequest::DeletePhoto { .. }
            | QueuedRequest::DeleteFieldValue { .. }
    )
}

fn mark_field_sent(fields: &mut [FieldValue], sent: &FieldValue, remote_id: Option<i64>) {
    if let Some(field) = fields.iter_mut().find(|f| f.field_id == sent.field_id) {
        if remote_id.is_some() {
            field.remote_id = remote_id;
        }
        // A newer local value must still go out
        if field.value == sent.value {
            field.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        FieldValue, ObservationBody, ObservationRecord, PendingPhotoAdd, PhotoRole, SyncMeta,
    };
    use crate::services::testing::{test_context, ScriptedTransport};
    use crate::services::transport::HttpMethod;
    use photo_store::PhotoBlob;
    use serde_json::json;

    struct Harness {
        ctx: SyncContext,
        transport: Arc<ScriptedTransport>,
        uploader: Uploader,
    }

    fn harness(project_id: Option<i64>) -> Harness {
        let transport = ScriptedTransport::new();
        let (ctx, _credentials) = test_context(transport.clone());
        let uploader = Uploader::new(
            ctx.clone(),
            Arc::new(RequestQueue::new(QueueName::Parent)),
            Arc::new(RequestQueue::new(QueueName::Dependent)),
            project_id,
        );
        Harness {
            ctx,
            transport,
            uploader,
        }
    }

    fn waiting_create(h: &Harness, photos: &[&str], fields: Vec<FieldValue>) -> Uuid {
        let mut meta = SyncMeta::new(ActionType::Create, Outcome::Waiting);
        for id in photos {
            meta.pending_photo_adds.push(PendingPhotoAdd::new(
                *id,
                PhotoBlob::new(vec![0xFF, 0xD8, 1], "image/jpeg"),
                PhotoRole::Primary,
            ));
        }
        let body = ObservationBody {
            species_guess: Some("Ardea cinerea".into()),
            field_values: fields,
            ..Default::default()
        };
        let record = ObservationRecord::new(Uuid::new_v4(), body, meta);
        let uuid = record.uuid;
        h.ctx.db.with_conn(|conn| h.ctx.store.put(conn, record)).unwrap();
        uuid
    }

    fn load(h: &Harness, uuid: &Uuid) -> ObservationRecord {
        h.ctx
            .db
            .with_conn(|conn| h.ctx.store.load(conn, uuid))
            .unwrap()
            .unwrap()
    }

    async fn drain_all(h: &Harness) {
        h.uploader.drain(QueueName::Parent).await.unwrap();
        h.uploader.drain(QueueName::Dependent).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_sends_parent_then_children_then_link() {
        let h = harness(Some(77));
        let uuid = waiting_create(&h, &["p1"], vec![FieldValue::new(4, "adult")]);

        assert_eq!(h.uploader.claim_waiting().unwrap(), 1);
        assert_eq!(load(&h, &uuid).meta.outcome, Outcome::BeingProcessed);
        drain_all(&h).await;

        assert_eq!(
            h.transport.sent_paths(),
            vec![
                "/observations",
                "/observation_photos",
                "/observation_field_values",
                "/project_observations"
            ]
        );
        let record = load(&h, &uuid);
        assert_eq!(record.meta.outcome, Outcome::Success);
        assert_eq!(record.remote_id, Some(1001));
        assert!(record.meta.pending_photo_adds.is_empty());
        assert_eq!(record.photos[0].remote_id, Some(1002));
        assert!(!record.body.field_values[0].dirty);
        assert_eq!(record.body.field_values[0].remote_id, Some(1003));
    }

    #[tokio::test]
    async fn test_photo_rejection_rolls_back_create() {
        let h = harness(Some(77));
        let uuid = waiting_create(&h, &["p1", "p2"], vec![FieldValue::new(4, "adult")]);
        h.transport.push(Ok(RemoteResponse::new(201, json!({"id": 500}))));
        h.transport.push(Ok(RemoteResponse::new(422, json!({"error": "Photo too large"}))));

        h.uploader.claim_waiting().unwrap();
        h.uploader.drain(QueueName::Parent).await.unwrap();
        let report = h.uploader.drain(QueueName::Dependent).await.unwrap();

        assert_eq!(report.failed, 1);
        // p2, the field value and the project link
        assert_eq!(report.skipped, 3);
        assert_eq!(load(&h, &uuid).meta.outcome, Outcome::SystemError);

        let parent_items = h
            .ctx
            .db
            .with_conn(|conn| h.uploader.parent.items(conn))
            .unwrap();
        assert_eq!(parent_items.len(), 1);
        assert_eq!(
            parent_items[0].request,
            QueuedRequest::RollbackCreate { remote_id: 500 }
        );

        h.uploader.drain(QueueName::Parent).await.unwrap();
        let last = h.transport.sent().pop().unwrap();
        assert_eq!(last.method, HttpMethod::Delete);
        assert_eq!(last.path, "/observations/500");

        let record = load(&h, &uuid);
        assert_eq!(record.remote_id, None);
        assert_eq!(record.meta.action_type, ActionType::Create);
        assert_eq!(record.meta.pending_photo_adds.len(), 2);
        assert!(record.body.field_values[0].dirty);
    }

    #[tokio::test]
    async fn test_update_child_failure_does_not_roll_back() {
        let h = harness(None);
        let mut meta = SyncMeta::new(ActionType::Update, Outcome::Waiting);
        meta.pending_photo_deletes = vec![8, 9];
        let mut record = ObservationRecord::new(Uuid::new_v4(), ObservationBody::default(), meta);
        record.remote_id = Some(40);
        let uuid = record.uuid;
        h.ctx.db.with_conn(|conn| h.ctx.store.put(conn, record)).unwrap();
        h.transport.push_status(200);
        h.transport.push(Ok(RemoteResponse::new(403, json!({"error": "not yours"}))));

        h.uploader.claim_waiting().unwrap();
        drain_all(&h).await;

        assert_eq!(load(&h, &uuid).meta.outcome, Outcome::SystemError);
        assert!(h
            .ctx
            .db
            .with_conn(|conn| h.uploader.parent.is_empty(conn))
            .unwrap());
        assert_eq!(h.transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_pauses_and_keeps_item() {
        let h = harness(None);
        let uuid = waiting_create(&h, &[], Vec::new());
        let mut events = h.ctx.notifier.subscribe();
        h.transport.push_status(401);

        h.uploader.claim_waiting().unwrap();
        let report = h.uploader.drain(QueueName::Parent).await.unwrap();

        assert_eq!(report.stop, Some(DrainStop::Credentials));
        let front = h
            .ctx
            .db
            .with_conn(|conn| h.uploader.parent.peek_front(conn))
            .unwrap()
            .unwrap();
        assert_eq!(front.request, QueuedRequest::CreateObservation);
        assert_eq!(front.attempts, 0);
        assert_eq!(load(&h, &uuid).meta.outcome, Outcome::BeingProcessed);

        let mut saw_stale = false;
        while let Ok(event) = events.try_recv() {
            saw_stale |= event == SyncEvent::CredentialsStale;
        }
        assert!(saw_stale);
    }

    #[tokio::test]
    async fn test_server_error_retries_same_item_first() {
        let h = harness(None);
        let first = waiting_create(&h, &[], Vec::new());
        waiting_create(&h, &[], Vec::new());
        h.transport.push_status(503);

        assert_eq!(h.uploader.claim_waiting().unwrap(), 2);
        let report = h.uploader.drain(QueueName::Parent).await.unwrap();

        assert_eq!(report.stop, Some(DrainStop::Transient));
        assert_eq!(h.transport.sent().len(), 1);
        let front = h
            .ctx
            .db
            .with_conn(|conn| h.uploader.parent.peek_front(conn))
            .unwrap()
            .unwrap();
        assert_eq!(front.obs_uuid, first);
        assert_eq!(front.attempts, 1);

        drain_all(&h).await;
        assert_eq!(load(&h, &first).meta.outcome, Outcome::Success);
    }

    #[tokio::test]
    async fn test_parent_422_is_user_error() {
        let h = harness(None);
        let uuid = waiting_create(&h, &[], Vec::new());
        h.transport.push(Ok(RemoteResponse::new(
            422,
            json!({"error": "Observed date is in the future"}),
        )));

        h.uploader.claim_waiting().unwrap();
        drain_all(&h).await;

        let record = load(&h, &uuid);
        assert_eq!(record.meta.outcome, Outcome::UserError);
        assert_eq!(
            record.meta.last_error.as_deref(),
            Some("Observed date is in the future")
        );
        let bundle = h
            .ctx
            .db
            .with_conn(|conn| completion::take_bundle(conn, &uuid))
            .unwrap();
        assert!(bundle.is_none());
    }

    #[tokio::test]
    async fn test_accepted_create_waits_for_pending_task() {
        let h = harness(None);
        let uuid = waiting_create(&h, &[], Vec::new());
        h.transport.push(Ok(RemoteResponse::new(
            202,
            json!({"status_url": "/tasks/abc"}),
        )));

        h.uploader.claim_waiting().unwrap();
        drain_all(&h).await;

        let record = load(&h, &uuid);
        assert_eq!(record.meta.outcome, Outcome::BeingProcessed);
        let task = h
            .ctx
            .db
            .with_conn(|conn| pending_tasks::get(conn, &uuid))
            .unwrap()
            .unwrap();
        assert_eq!(task.status_check_handle, "/tasks/abc");
        assert_eq!(task.action_type, ActionType::Create);
    }

    #[tokio::test]
    async fn test_delete_404_counts_as_success() {
        let h = harness(None);
        let mut record = ObservationRecord::new(
            Uuid::new_v4(),
            ObservationBody::default(),
            SyncMeta::new(ActionType::Delete, Outcome::Waiting),
        );
        record.remote_id = Some(12);
        let uuid = record.uuid;
        h.ctx.db.with_conn(|conn| h.ctx.store.put(conn, record)).unwrap();
        h.transport.push_status(404);

        h.uploader.claim_waiting().unwrap();
        drain_all(&h).await;

        assert!(h
            .ctx
            .db
            .with_conn(|conn| h.ctx.store.load(conn, &uuid))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_never_sent_delete_is_purged_without_network() {
        let h = harness(None);
        let record = ObservationRecord::new(
            Uuid::new_v4(),
            ObservationBody::default(),
            SyncMeta::new(ActionType::Delete, Outcome::Waiting),
        );
        let uuid = record.uuid;
        h.ctx.db.with_conn(|conn| h.ctx.store.put(conn, record)).unwrap();

        h.uploader.claim_waiting().unwrap();

        assert!(h.transport.sent().is_empty());
        assert!(h
            .ctx
            .db
            .with_conn(|conn| h.ctx.store.load(conn, &uuid))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_drafts_are_not_claimed() {
        let h = harness(None);
        let record = ObservationRecord::new(
            Uuid::new_v4(),
            ObservationBody::default(),
            SyncMeta::new(ActionType::Create, Outcome::Draft),
        );
        h.ctx.db.with_conn(|conn| h.ctx.store.put(conn, record)).unwrap();

        assert_eq!(h.uploader.claim_waiting().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocked_action_is_promoted_on_success() {
        let h = harness(None);
        let uuid = waiting_create(&h, &[], Vec::new());
        h.uploader.claim_waiting().unwrap();

        h.ctx
            .db
            .with_conn(|conn| {
                h.ctx.store.update(conn, &uuid, |record| {
                    record.meta.blocked_action = Some(crate::models::BlockedAction {
                        action_type: ActionType::Update,
                        outcome: Outcome::Waiting,
                        patch: crate::models::ObservationPatch {
                            caption: Some("later".into()),
                            ..Default::default()
                        },
                        pending_photo_adds: Vec::new(),
                        pending_photo_deletes: vec![5],
                        pending_field_deletes: Vec::new(),
                        last_updated_at: chrono::Utc::now(),
                    });
                    Ok(())
                })
            })
            .unwrap();

        drain_all(&h).await;

        let record = load(&h, &uuid);
        assert_eq!(record.meta.outcome, Outcome::Waiting);
        assert_eq!(record.meta.action_type, ActionType::Update);
        assert_eq!(record.body.caption.as_deref(), Some("later"));
        assert_eq!(record.meta.pending_photo_deletes, vec![5]);
        assert!(record.meta.blocked_action.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_a_no_op() {
        let h = harness(None);
        let queue = h.uploader.queue(QueueName::Parent);
        let _guard = queue.try_begin_drain().unwrap();

        let report = h.uploader.drain(QueueName::Parent).await.unwrap();
        assert!(report.already_running);
    }
}
