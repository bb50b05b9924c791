use crate::models::observation::ActionType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An asynchronous server-side job the remote accepted but has not finished
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub uuid: Uuid,
    pub action_type: ActionType,
    /// Path or URL polled for the job's status
    pub status_check_handle: String,
    pub created_at: DateTime<Utc>,
}

impl PendingTask {
    pub fn new(uuid: Uuid, action_type: ActionType, status_check_handle: String) -> Self {
        Self {
            uuid,
            action_type,
            status_check_handle,
            created_at: Utc::now(),
        }
    }
}

/// Status reported by a pending task's status endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Processing,
    Success,
    Failure,
}
