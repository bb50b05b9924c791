use crate::models::observation::ActionType;
use crate::models::outcome::Outcome;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lightweight status row for the local queue overview
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusRow {
    pub uuid: Uuid,
    pub outcome: Outcome,
    pub action_type: ActionType,
    pub has_blocked_action: bool,
    /// In flight, yet nothing is queued or pending for it
    pub possibly_stuck: bool,
}

/// What `save_edit` hands back: the remote id once known, else the uuid
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RecordIdentity {
    Remote(i64),
    Local(Uuid),
}
