pub mod background_sync;
pub mod completion;
pub mod context;
pub mod credentials;
pub mod edit_strategy;
pub mod meta_store;
pub mod notifier;
pub mod pending_tasks;
pub mod record_store;
pub mod remote_cache;
pub mod request_builder;
pub mod request_queue;
pub mod sync_engine;
pub mod transport;
pub mod uploader;

#[cfg(test)]
pub mod testing;

pub use background_sync::BackgroundSync;
pub use credentials::{Credential, CredentialProvider, SharedCredential};
pub use edit_strategy::EditRequest;
pub use notifier::SyncEvent;
pub use request_builder::{ApiRequestBuilder, RequestBuilder};
pub use sync_engine::{SyncEngine, SyncStats};
pub use transport::{HttpTransport, RemoteTransport};
