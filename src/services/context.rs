use crate::database::Database;
use crate::services::credentials::CredentialProvider;
use crate::services::notifier::Notifier;
use crate::services::record_store::RecordStore;
use crate::services::request_builder::RequestBuilder;
use crate::services::transport::RemoteTransport;
use std::sync::Arc;

/// Collaborators shared by the uploader, the poller and the engine facade
#[derive(Clone)]
pub struct SyncContext {
    pub db: Database,
    pub store: Arc<RecordStore>,
    pub notifier: Notifier,
    pub credentials: Arc<dyn CredentialProvider>,
    pub transport: Arc<dyn RemoteTransport>,
    pub builder: Arc<dyn RequestBuilder>,
}
