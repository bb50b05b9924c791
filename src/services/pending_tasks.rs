//! Server-side jobs the remote accepted but has not finished, and the poller
//! that watches them.

use crate::error::AppError;
use crate::models::{ActionType, Outcome, PendingTask, TaskStatus};
use crate::services::completion;
use crate::services::context::SyncContext;
use crate::services::meta_store::{self, PENDING_TASKS_KEY};
use crate::services::notifier::SyncEvent;
use crate::services::remote_cache::{self, RemoteObservation};
use crate::services::request_queue::RequestQueue;
use crate::services::transport::classify;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

type TaskMap = BTreeMap<Uuid, PendingTask>;

fn load_all(conn: &Connection) -> Result<TaskMap, AppError> {
    Ok(meta_store::get_json(conn, PENDING_TASKS_KEY)?.unwrap_or_default())
}

pub fn list(conn: &Connection) -> Result<Vec<PendingTask>, AppError> {
    Ok(load_all(conn)?.into_values().collect())
}

pub fn get(conn: &Connection, uuid: &Uuid) -> Result<Option<PendingTask>, AppError> {
    Ok(load_all(conn)?.remove(uuid))
}

pub fn has(conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
    Ok(load_all(conn)?.contains_key(uuid))
}

/// Records `task`, replacing any earlier task for the same uuid
pub fn add(conn: &Connection, task: PendingTask) -> Result<(), AppError> {
    let mut tasks = load_all(conn)?;
    if let Some(old) = tasks.insert(task.uuid, task) {
        log::debug!("Replaced pending task for {}", old.uuid);
    }
    meta_store::set_json(conn, PENDING_TASKS_KEY, &tasks)
}

pub fn remove(conn: &Connection, uuid: &Uuid) -> Result<bool, AppError> {
    let mut tasks = load_all(conn)?;
    let removed = tasks.remove(uuid).is_some();
    if removed {
        meta_store::set_json(conn, PENDING_TASKS_KEY, &tasks)?;
    }
    Ok(removed)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    /// No credential was available; nothing was polled
    pub skipped: bool,
}

pub struct PendingTaskPoller {
    ctx: SyncContext,
    dependent: Arc<RequestQueue>,
    interval: Duration,
    running: Arc<AtomicBool>,
    wake: Option<Arc<Notify>>,
}

impl PendingTaskPoller {
    pub fn new(ctx: SyncContext, dependent: Arc<RequestQueue>, interval: Duration) -> Self {
        Self {
            ctx,
            dependent,
            interval,
            running: Arc::new(AtomicBool::new(false)),
            wake: None,
        }
    }

    /// Signalled after a task succeeded and its dependents were queued
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Checks every pending task once
    pub async fn poll_once(&self) -> Result<PollReport, AppError> {
        let mut report = PollReport::default();
        let tasks = self.ctx.db.with_conn(list)?;
        if tasks.is_empty() {
            return Ok(report);
        }

        for task in tasks {
            // Re-read per request; the credential may change mid-pass
            let Some(credential) = self.ctx.credentials.current() else {
                log::debug!("No credential, skipping pending task poll");
                report.skipped = true;
                return Ok(report);
            };

            let request = self.ctx.builder.status_check(&task.status_check_handle);
            report.checked += 1;
            let response = match self
                .ctx
                .transport
                .execute(request, &credential)
                .await
                .and_then(classify)
            {
                Ok(response) => response,
                Err(AppError::Auth) => {
                    self.ctx.notifier.send(SyncEvent::CredentialsStale);
                    return Ok(report);
                }
                Err(e) => {
                    log::warn!("Status check for {} failed: {}", task.uuid, e);
                    continue;
                }
            };

            let status = response
                .body
                .get("status")
                .cloned()
                .and_then(|s| serde_json::from_value::<TaskStatus>(s).ok());

            let applied = match status {
                Some(TaskStatus::Processing) => continue,
                Some(TaskStatus::Success) => self
                    .ctx
                    .db
                    .with_tx(|conn| self.apply_success(conn, &task, &response.body))
                    .map(|()| true),
                Some(TaskStatus::Failure) => self
                    .ctx
                    .db
                    .with_tx(|conn| self.apply_failure(conn, &task, &response.body))
                    .map(|()| false),
                None => {
                    log::warn!(
                        "Unreadable status for pending task {}: {}",
                        task.uuid,
                        response.body
                    );
                    continue;
                }
            };

            match applied {
                Ok(true) => report.completed += 1,
                Ok(false) => report.failed += 1,
                Err(e @ AppError::Database(_)) => return Err(e),
                Err(e) => {
                    log::error!("Cannot apply result of pending task {}: {}", task.uuid, e);
                    self.ctx
                        .db
                        .with_tx(|conn| self.abandon(conn, &task, &e.to_string()))?;
                    report.failed += 1;
                }
            }
        }

        if report.completed > 0 {
            if let Some(wake) = &self.wake {
                wake.notify_one();
            }
        }
        Ok(report)
    }

    fn apply_success(
        &self,
        conn: &Connection,
        task: &PendingTask,
        body: &Value,
    ) -> Result<(), AppError> {
        remove(conn, &task.uuid)?;

        if task.action_type == ActionType::Delete {
            completion::finish_delete(&self.ctx, conn, &task.uuid)?;
            log::info!("Remote delete of {} completed", task.uuid);
            return Ok(());
        }

        let echo = body.get("observation").unwrap_or(body);
        let remote = RemoteObservation::from_echo(echo);
        let remote_id = match &remote {
            Some(remote) => Some(remote.id),
            None => self
                .ctx
                .store
                .load(conn, &task.uuid)?
                .and_then(|r| r.remote_id),
        };
        if let Some(remote) = remote {
            remote_cache::upsert(conn, task.uuid, remote)?;
        }

        let remote_id = remote_id.ok_or_else(|| {
            AppError::Consistency(format!("Task for {} finished without a remote id", task.uuid))
        })?;
        completion::parent_accepted(&self.ctx, conn, &self.dependent, &task.uuid, remote_id)?;
        log::info!("Remote {} of {} completed", task.action_type.as_str(), task.uuid);
        Ok(())
    }

    fn apply_failure(
        &self,
        conn: &Connection,
        task: &PendingTask,
        body: &Value,
    ) -> Result<(), AppError> {
        remove(conn, &task.uuid)?;
        completion::discard_bundle(conn, &task.uuid)?;
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Remote processing failed")
            .to_string();
        completion::fail_record(&self.ctx, conn, &task.uuid, Outcome::SystemError, &message)
    }

    /// Drops a task whose result cannot be applied so later tasks still settle
    fn abandon(
        &self,
        conn: &Connection,
        task: &PendingTask,
        message: &str,
    ) -> Result<(), AppError> {
        remove(conn, &task.uuid)?;
        completion::discard_bundle(conn, &task.uuid)?;
        completion::fail_record(&self.ctx, conn, &task.uuid, Outcome::SystemError, message)
    }

    /// Starts the poll loop unless it is already running. The loop stops by
    /// itself once no task is left.
    pub fn ensure_running(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let poller = Arc::clone(self);
        tokio::spawn(async move {
            log::debug!("Pending task poller started");
            loop {
                tokio::time::sleep(poller.interval).await;
                if let Err(e) = poller.poll_once().await {
                    log::error!("Pending task poll failed: {}", e);
                }

                if poller.has_tasks() {
                    continue;
                }
                poller.running.store(false, Ordering::SeqCst);
                // A task added between the check and the flag reset must not be stranded
                if !poller.has_tasks() || poller.running.swap(true, Ordering::SeqCst) {
                    break;
                }
            }
            log::debug!("Pending task poller stopped");
        });
    }

    fn has_tasks(&self) -> bool {
        match self.ctx.db.with_conn(|conn| Ok(!load_all(conn)?.is_empty())) {
            Ok(has) => has,
            Err(e) => {
                log::error!("Cannot read pending tasks: {}", e);
                false
            }
        }
    }
}
