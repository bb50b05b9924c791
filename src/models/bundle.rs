use crate::models::observation::{ActionType, FieldValue, PhotoRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A photo that must be uploaded once its parent exists remotely
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoUpload {
    pub local_id: String,
    pub role: PhotoRole,
}

/// Request that closes a bundle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalRequest {
    /// Attach the created observation to its project
    LinkToProject { project_id: i64 },
    /// Queue-internal marker, never sent
    BundleComplete,
}

/// Everything that has to follow one accepted parent mutation.
///
/// Stored when the parent request is queued; deleted once its dependent
/// requests have been generated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DependentRequestBundle {
    pub obs_uuid: Uuid,
    pub parent_action: ActionType,
    pub remote_parent_id: Option<i64>,
    pub photo_uploads: Vec<PhotoUpload>,
    pub field_values: Vec<FieldValue>,
    pub photo_deletes: Vec<i64>,
    pub field_deletes: Vec<i64>,
    pub terminal: TerminalRequest,
    pub created_at: DateTime<Utc>,
}
