pub mod bundle;
pub mod observation;
pub mod outcome;
pub mod pending_task;
pub mod queue_summary;
pub mod request;

pub use bundle::{DependentRequestBundle, PhotoUpload, TerminalRequest};
pub use observation::{
    ActionType, BlockedAction, FieldValue, NewObservation, ObservationBody, ObservationPatch,
    ObservationRecord, PendingPhotoAdd, PhotoBlobRef, PhotoRef, PhotoRole, SyncMeta,
    CURRENT_SCHEMA_VERSION,
};
pub use outcome::Outcome;
pub use pending_task::{PendingTask, TaskStatus};
pub use queue_summary::{QueueStatusRow, RecordIdentity};
pub use request::{NewQueueItem, QueueItem, QueueName, QueuedRequest};
