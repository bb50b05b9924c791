//! Decides how an incoming edit or delete merges into a local record that may
//! already be in flight.
//!
//! Pure merge logic: nothing here touches the database or the network. The
//! caller stores the returned record and triggers an upload when asked to.

use crate::error::AppError;
use crate::models::{
    ActionType, BlockedAction, ObservationPatch, ObservationRecord, Outcome, PendingPhotoAdd,
    SyncMeta,
};
use crate::services::remote_cache::RemoteObservation;
use chrono::Utc;
use uuid::Uuid;

/// One edit or delete as submitted by the caller
#[derive(Debug, Clone, Default)]
pub struct EditRequest {
    /// Declared action. `Create` is treated like `Update`; the resolver picks
    /// the action that is actually sent.
    pub action_type: Option<ActionType>,
    pub patch: ObservationPatch,
    pub photo_adds: Vec<PendingPhotoAdd>,
    pub photo_deletes: Vec<i64>,
    pub field_deletes: Vec<i64>,
    pub is_draft: bool,
}

impl EditRequest {
    pub fn delete() -> Self {
        Self {
            action_type: Some(ActionType::Delete),
            ..Default::default()
        }
    }

    fn is_delete(&self) -> bool {
        self.action_type == Some(ActionType::Delete)
    }

    fn queued_outcome(&self) -> Outcome {
        if self.is_draft {
            Outcome::Draft
        } else {
            Outcome::Waiting
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyKey {
    /// Outcome is `beingProcessed`, or a pending task exists
    pub processing: bool,
    /// A local record exists
    pub queued: bool,
    /// The local record carries a blocked action
    pub blocked: bool,
    /// The observation exists remotely
    pub remote: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing local and nothing remote
    NothingToEdit,
    /// Start a fresh local record from the remote snapshot
    DirectFromRemote,
    /// Merge into a record that was never sent; stays a create
    MergeForceCreate,
    /// Merge into the queued primary action as an update
    MergeQueued,
    /// Fold the leftover blocked action into the primary, then merge
    FoldBlockedThenMerge,
    /// Merge into the blocked action, leaving the in-flight meta alone
    MergeBlocked,
    /// Server is processing a record we no longer hold; keep the edit behind it
    ProcessingShell,
}

impl StrategyKey {
    pub fn for_record(
        record: Option<&ObservationRecord>,
        remote: Option<&RemoteObservation>,
        has_pending_task: bool,
    ) -> Self {
        Self {
            processing: has_pending_task
                || record.is_some_and(|r| r.meta.outcome == Outcome::BeingProcessed),
            queued: record.is_some(),
            blocked: record.is_some_and(|r| r.meta.blocked_action.is_some()),
            remote: remote.is_some() || record.is_some_and(|r| r.remote_id.is_some()),
        }
    }

    pub fn strategy(&self) -> Result<Strategy, AppError> {
        let key = (self.processing, self.queued, self.blocked, self.remote);
        match key {
            (_, false, true, _) => Err(AppError::Consistency(format!(
                "Blocked action without a queued action: {:?}",
                self
            ))),
            (false, false, false, false) => Ok(Strategy::NothingToEdit),
            (false, false, false, true) => Ok(Strategy::DirectFromRemote),
            (false, true, false, false) => Ok(Strategy::MergeForceCreate),
            (false, true, false, true) => Ok(Strategy::MergeQueued),
            (false, true, true, _) => Ok(Strategy::FoldBlockedThenMerge),
            (true, true, _, _) => Ok(Strategy::MergeBlocked),
            (true, false, false, _) => Ok(Strategy::ProcessingShell),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Store this record; `upload` asks the caller to trigger a sync
    Put { record: ObservationRecord, upload: bool },
    /// Remove the local record; it never reached the remote
    PurgeLocal { uuid: Uuid },
}

/// Merges `edit` into whatever is known about `uuid`
pub fn resolve(
    uuid: Uuid,
    existing: Option<ObservationRecord>,
    remote: Option<&RemoteObservation>,
    has_pending_task: bool,
    edit: EditRequest,
) -> Result<Resolution, AppError> {
    let key = StrategyKey::for_record(existing.as_ref(), remote, has_pending_task);
    let strategy = key.strategy()?;
    log::debug!("Edit of {} resolved with {:?} for {:?}", uuid, strategy, key);

    match (strategy, existing) {
        (Strategy::NothingToEdit, _) => {
            Err(AppError::NotFound(format!("Observation {}", uuid)))
        }
        (Strategy::DirectFromRemote, _) => {
            let remote = remote.ok_or_else(|| {
                AppError::Consistency(format!("Remote copy of {} vanished", uuid))
            })?;
            let action = if edit.is_delete() {
                ActionType::Delete
            } else {
                ActionType::Update
            };
            let mut record = ObservationRecord::new(
                uuid,
                remote.body.clone(),
                SyncMeta::new(action, edit.queued_outcome()),
            );
            record.remote_id = Some(remote.id);
            merge_into_primary(&mut record, edit)
        }
        (Strategy::MergeForceCreate | Strategy::MergeQueued, Some(mut record)) => {
            if let Some(remote) = remote {
                record.remote_id.get_or_insert(remote.id);
            }
            merge_into_primary(&mut record, edit)
        }
        (Strategy::FoldBlockedThenMerge, Some(mut record)) => {
            fold_blocked_action(&mut record);
            merge_into_primary(&mut record, edit)
        }
        (Strategy::MergeBlocked, Some(mut record)) => {
            merge_into_blocked(&mut record, edit)?;
            Ok(Resolution::Put {
                record,
                upload: false,
            })
        }
        (Strategy::ProcessingShell, _) => {
            let meta = SyncMeta::new(ActionType::Update, Outcome::BeingProcessed);
            let body = remote.map(|r| r.body.clone()).unwrap_or_default();
            let mut record = ObservationRecord::new(uuid, body, meta);
            record.remote_id = remote.map(|r| r.id);
            merge_into_blocked(&mut record, edit)?;
            Ok(Resolution::Put {
                record,
                upload: false,
            })
        }
        (strategy, None) => Err(AppError::Consistency(format!(
            "{:?} needs a local record for {}",
            strategy, uuid
        ))),
    }
}

/// A record is on the remote once it has a remote id or has been sent as an update
fn was_sent(record: &ObservationRecord) -> bool {
    record.remote_id.is_some() || record.meta.action_type != ActionType::Create
}

fn merge_into_primary(
    record: &mut ObservationRecord,
    edit: EditRequest,
) -> Result<Resolution, AppError> {
    if edit.is_delete() {
        if !was_sent(record) {
            return Ok(Resolution::PurgeLocal { uuid: record.uuid });
        }
        record.meta.action_type = ActionType::Delete;
    } else if record.meta.action_type == ActionType::Delete {
        return Err(AppError::Validation(format!(
            "Observation {} is queued for deletion",
            record.uuid
        )));
    } else if !was_sent(record) {
        record.meta.action_type = ActionType::Create;
    } else {
        record.meta.action_type = ActionType::Update;
    }

    let outcome = edit.queued_outcome();
    edit.patch.apply_to(&mut record.body);
    let meta = &mut record.meta;
    meta.pending_photo_adds.extend(edit.photo_adds);
    meta.pending_photo_deletes.extend(edit.photo_deletes);
    meta.pending_field_deletes.extend(edit.field_deletes);
    meta.last_error = None;
    meta.set_outcome(outcome)?;

    Ok(Resolution::Put {
        record: record.clone(),
        upload: outcome == Outcome::Waiting,
    })
}

fn merge_into_blocked(record: &mut ObservationRecord, edit: EditRequest) -> Result<(), AppError> {
    if record.meta.action_type == ActionType::Delete && !edit.is_delete() {
        return Err(AppError::Validation(format!(
            "Observation {} is being deleted",
            record.uuid
        )));
    }

    let outcome = edit.queued_outcome();
    let blocked = record
        .meta
        .blocked_action
        .get_or_insert_with(|| BlockedAction {
            action_type: ActionType::Update,
            outcome,
            patch: ObservationPatch::default(),
            pending_photo_adds: Vec::new(),
            pending_photo_deletes: Vec::new(),
            pending_field_deletes: Vec::new(),
            last_updated_at: Utc::now(),
        });

    if edit.is_delete() {
        blocked.action_type = ActionType::Delete;
    }
    blocked.outcome = Outcome::transition(Some(blocked.outcome), outcome)?;
    blocked.patch.merge(&edit.patch);
    blocked.pending_photo_adds.extend(edit.photo_adds);
    blocked.pending_photo_deletes.extend(edit.photo_deletes);
    blocked.pending_field_deletes.extend(edit.field_deletes);
    blocked.last_updated_at = Utc::now();
    Ok(())
}

/// Moves a leftover blocked action into the primary action. Used before
/// merging a new edit and on explicit retry. Outcome is left to the caller.
pub fn fold_blocked_action(record: &mut ObservationRecord) {
    let Some(blocked) = record.meta.blocked_action.take() else {
        return;
    };

    blocked.patch.apply_to(&mut record.body);
    let meta = &mut record.meta;
    meta.pending_photo_adds.extend(blocked.pending_photo_adds);
    meta.pending_photo_deletes.extend(blocked.pending_photo_deletes);
    meta.pending_field_deletes.extend(blocked.pending_field_deletes);
    if blocked.action_type == ActionType::Delete {
        meta.action_type = ActionType::Delete;
    }
}

/// Makes the blocked action the new primary once the in-flight one has
/// succeeded. Returns false when there was nothing to promote.
pub fn promote_blocked_action(record: &mut ObservationRecord) -> Result<bool, AppError> {
    let Some(blocked) = record.meta.blocked_action.take() else {
        return Ok(false);
    };

    blocked.patch.apply_to(&mut record.body);
    let meta = &mut record.meta;
    meta.action_type = match blocked.action_type {
        ActionType::Delete => ActionType::Delete,
        _ => ActionType::Update,
    };
    meta.pending_photo_adds = blocked.pending_photo_adds;
    meta.pending_photo_deletes = blocked.pending_photo_deletes;
    meta.pending_field_deletes = blocked.pending_field_deletes;
    meta.last_error = None;
    meta.set_outcome(match blocked.outcome {
        Outcome::Draft => Outcome::Draft,
        _ => Outcome::Waiting,
    })?;
    Ok(true)
}
