use crate::models::observation::{ActionType, FieldValue, PhotoRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two independent queues
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    /// Parent mutations and rollbacks
    Parent,
    /// Children that need an accepted parent
    Dependent,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Parent => "parent",
            QueueName::Dependent => "dependent",
        }
    }
}

/// What a queue item asks the remote to do
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuedRequest {
    CreateObservation,
    UpdateObservation { remote_id: i64 },
    DeleteObservation { remote_id: i64 },
    UploadPhoto { local_id: String, role: PhotoRole },
    DeletePhoto { remote_photo_id: i64 },
    UpsertFieldValue { field: FieldValue },
    DeleteFieldValue { remote_field_id: i64 },
    LinkToProject { project_id: i64 },
    /// Compensating delete of a parent whose children failed
    RollbackCreate { remote_id: i64 },
    BundleComplete,
}

impl QueuedRequest {
    /// Items handled without any network call
    pub fn is_local_only(&self) -> bool {
        matches!(self, QueuedRequest::BundleComplete)
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueuedRequest::CreateObservation => "create_observation",
            QueuedRequest::UpdateObservation { .. } => "update_observation",
            QueuedRequest::DeleteObservation { .. } => "delete_observation",
            QueuedRequest::UploadPhoto { .. } => "upload_photo",
            QueuedRequest::DeletePhoto { .. } => "delete_photo",
            QueuedRequest::UpsertFieldValue { .. } => "upsert_field_value",
            QueuedRequest::DeleteFieldValue { .. } => "delete_field_value",
            QueuedRequest::LinkToProject { .. } => "link_to_project",
            QueuedRequest::RollbackCreate { .. } => "rollback_create",
            QueuedRequest::BundleComplete => "bundle_complete",
        }
    }
}

/// One persisted queue entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub id: i64,
    pub request_id: String,
    pub queue: QueueName,
    pub obs_uuid: Uuid,
    pub parent_action: ActionType,
    pub remote_parent_id: Option<i64>,
    pub request: QueuedRequest,
    pub attempts: u32,
    /// Skipped after the parent was compensated
    pub ignored: bool,
    pub created_at: DateTime<Utc>,
}

/// A queue item before it has a row id
#[derive(Debug, Clone, PartialEq)]
pub struct NewQueueItem {
    pub obs_uuid: Uuid,
    pub parent_action: ActionType,
    pub remote_parent_id: Option<i64>,
    pub request: QueuedRequest,
}

impl NewQueueItem {
    pub fn new(
        obs_uuid: Uuid,
        parent_action: ActionType,
        remote_parent_id: Option<i64>,
        request: QueuedRequest,
    ) -> Self {
        Self {
            obs_uuid,
            parent_action,
            remote_parent_id,
            request,
        }
    }
}
