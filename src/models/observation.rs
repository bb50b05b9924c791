use crate::error::AppError;
use crate::models::outcome::Outcome;
use chrono::{DateTime, Utc};
use photo_store::PhotoBlob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Version stamped onto every record written by the record store
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// The remote mutation a record's sync metadata asks for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(ActionType::Create),
            "update" => Some(ActionType::Update),
            "delete" => Some(ActionType::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhotoRole {
    #[default]
    Primary,
    Detail,
}

impl PhotoRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoRole::Primary => "primary",
            PhotoRole::Detail => "detail",
        }
    }
}

/// Where the bytes of a pending photo currently live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PhotoBlobRef {
    /// Bytes carried inside the record; split out on the next `put`
    Inline { blob: PhotoBlob },
    /// Full-size bytes live in the photo store under the photo's local id
    Stored,
    /// Only a thumbnail is kept locally
    Thumbnail,
}

/// A photo attached by an edit and not yet uploaded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingPhotoAdd {
    pub local_id: String,
    /// `None` means the photo was explicitly cleared
    pub blob: Option<PhotoBlobRef>,
    #[serde(default)]
    pub role: PhotoRole,
}

impl PendingPhotoAdd {
    pub fn new(local_id: impl Into<String>, blob: PhotoBlob, role: PhotoRole) -> Self {
        Self {
            local_id: local_id.into(),
            blob: Some(PhotoBlobRef::Inline { blob }),
            role,
        }
    }

    /// Generates an opaque local id for a photo that has no remote id yet
    pub fn new_local_id() -> String {
        format!("local-{}", ulid::Ulid::new())
    }
}

/// Display entry for a photo of an observation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoRef {
    pub local_id: Option<String>,
    pub remote_id: Option<i64>,
    #[serde(default)]
    pub role: PhotoRole,
}

/// One observation field value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldValue {
    pub field_id: i64,
    pub value: String,
    pub remote_id: Option<i64>,
    /// Changed locally and not yet sent
    #[serde(default)]
    pub dirty: bool,
}

impl FieldValue {
    pub fn new(field_id: i64, value: impl Into<String>) -> Self {
        Self {
            field_id,
            value: value.into(),
            remote_id: None,
            dirty: true,
        }
    }
}

/// Domain fields of an observation. Opaque to the sync engine apart from
/// field values, which are sent as dependent requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObservationBody {
    pub species_guess: Option<String>,
    pub caption: Option<String>,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub field_values: Vec<FieldValue>,
}

/// A set of body changes. `None` leaves a field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ObservationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub species_guess: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub field_values: Vec<FieldValue>,
}

impl ObservationPatch {
    pub fn is_empty(&self) -> bool {
        *self == ObservationPatch::default()
    }

    /// Writes every set field into `body`. Field values are upserted by
    /// field id and marked dirty.
    pub fn apply_to(&self, body: &mut ObservationBody) {
        if let Some(v) = &self.species_guess {
            body.species_guess = Some(v.clone());
        }
        if let Some(v) = &self.caption {
            body.caption = Some(v.clone());
        }
        if let Some(v) = &self.description {
            body.description = Some(v.clone());
        }
        if let Some(v) = self.latitude {
            body.latitude = Some(v);
        }
        if let Some(v) = self.longitude {
            body.longitude = Some(v);
        }
        if let Some(v) = self.observed_at {
            body.observed_at = Some(v);
        }
        for incoming in &self.field_values {
            match body
                .field_values
                .iter_mut()
                .find(|fv| fv.field_id == incoming.field_id)
            {
                Some(existing) => {
                    existing.value = incoming.value.clone();
                    existing.dirty = true;
                }
                None => {
                    let mut fv = incoming.clone();
                    fv.dirty = true;
                    body.field_values.push(fv);
                }
            }
        }
    }

    /// Folds a newer patch into this one; fields set in `newer` win
    pub fn merge(&mut self, newer: &ObservationPatch) {
        if newer.species_guess.is_some() {
            self.species_guess = newer.species_guess.clone();
        }
        if newer.caption.is_some() {
            self.caption = newer.caption.clone();
        }
        if newer.description.is_some() {
            self.description = newer.description.clone();
        }
        if newer.latitude.is_some() {
            self.latitude = newer.latitude;
        }
        if newer.longitude.is_some() {
            self.longitude = newer.longitude;
        }
        if newer.observed_at.is_some() {
            self.observed_at = newer.observed_at;
        }
        for incoming in &newer.field_values {
            match self
                .field_values
                .iter_mut()
                .find(|fv| fv.field_id == incoming.field_id)
            {
                Some(existing) => existing.value = incoming.value.clone(),
                None => self.field_values.push(incoming.clone()),
            }
        }
    }
}

/// A follow-up action queued behind the one currently in flight.
///
/// Has no blocked slot of its own, so only one level of deferral exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlockedAction {
    pub action_type: ActionType,
    pub outcome: Outcome,
    #[serde(default)]
    pub patch: ObservationPatch,
    #[serde(default)]
    pub pending_photo_adds: Vec<PendingPhotoAdd>,
    #[serde(default)]
    pub pending_photo_deletes: Vec<i64>,
    #[serde(default)]
    pub pending_field_deletes: Vec<i64>,
    pub last_updated_at: DateTime<Utc>,
}

/// Synchronization state embedded in every record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub action_type: ActionType,
    pub outcome: Outcome,
    #[serde(default)]
    pub pending_photo_adds: Vec<PendingPhotoAdd>,
    #[serde(default)]
    pub pending_photo_deletes: Vec<i64>,
    #[serde(default)]
    pub pending_field_deletes: Vec<i64>,
    #[serde(default)]
    pub blocked_action: Option<BlockedAction>,
    /// Message from the last rejected attempt
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_outcome_change_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub schema_version: u32,
}

impl SyncMeta {
    pub fn new(action_type: ActionType, outcome: Outcome) -> Self {
        let now = Utc::now();
        Self {
            action_type,
            outcome,
            pending_photo_adds: Vec::new(),
            pending_photo_deletes: Vec::new(),
            pending_field_deletes: Vec::new(),
            blocked_action: None,
            last_error: None,
            last_outcome_change_at: Some(now),
            last_updated_at: now,
            schema_version: CURRENT_SCHEMA_VERSION,
        }
    }

    /// Moves the primary action to `to`, enforcing the state machine
    pub fn set_outcome(&mut self, to: Outcome) -> Result<(), AppError> {
        let from = self.outcome;
        self.outcome = Outcome::transition(Some(from), to)?;
        if from != to {
            self.last_outcome_change_at = Some(Utc::now());
        }
        log::debug!("Outcome {} -> {}", from, to);
        Ok(())
    }
}

/// One user-created, edited or deleted observation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObservationRecord {
    pub uuid: Uuid,
    pub remote_id: Option<i64>,
    #[serde(default)]
    pub body: ObservationBody,
    #[serde(default)]
    pub photos: Vec<PhotoRef>,
    pub meta: SyncMeta,
    pub created_at: DateTime<Utc>,
}

impl ObservationRecord {
    pub fn new(uuid: Uuid, body: ObservationBody, meta: SyncMeta) -> Self {
        Self {
            uuid,
            remote_id: None,
            body,
            photos: Vec::new(),
            meta,
            created_at: Utc::now(),
        }
    }

    /// Every photo id this record keeps locally, including photos queued by
    /// its blocked action
    pub fn local_photo_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self
            .photos
            .iter()
            .filter_map(|p| p.local_id.clone())
            .collect();
        ids.extend(self.meta.pending_photo_adds.iter().map(|p| p.local_id.clone()));
        if let Some(blocked) = &self.meta.blocked_action {
            ids.extend(blocked.pending_photo_adds.iter().map(|p| p.local_id.clone()));
        }
        ids
    }

    /// Body fields that are changed locally and not yet sent
    pub fn dirty_field_values(&self) -> Vec<FieldValue> {
        self.body
            .field_values
            .iter()
            .filter(|fv| fv.dirty)
            .cloned()
            .collect()
    }
}

/// Input for a brand-new observation
#[derive(Debug, Clone, Default)]
pub struct NewObservation {
    /// Client-generated identity; a fresh v4 uuid is used when absent
    pub uuid: Option<Uuid>,
    pub body: ObservationBody,
    pub photos: Vec<PendingPhotoAdd>,
}
