//! Test doubles for the remote side

use crate::database::Database;
use crate::error::AppError;
use crate::services::context::SyncContext;
use crate::services::credentials::{Credential, SharedCredential};
use crate::services::notifier::Notifier;
use crate::services::record_store::RecordStore;
use crate::services::request_builder::ApiRequestBuilder;
use crate::services::transport::{RemoteRequest, RemoteResponse, RemoteTransport};
use async_trait::async_trait;
use photo_store::PhotoStoreConfig;
use serde_json::json;
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

/// Answers requests from a script, in order. Once the script is empty every
/// request gets `201 {"id": 1000 + n}`.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<RemoteResponse, AppError>>>,
    sent: Mutex<Vec<RemoteRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, response: Result<RemoteResponse, AppError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn push_status(&self, status: u16) {
        self.push(Ok(RemoteResponse::new(status, json!({}))));
    }

    pub fn sent(&self) -> Vec<RemoteRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_paths(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.path).collect()
    }
}

#[async_trait]
impl RemoteTransport for ScriptedTransport {
    async fn execute(
        &self,
        request: RemoteRequest,
        _credential: &Credential,
    ) -> Result<RemoteResponse, AppError> {
        let n = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(request);
            sent.len() as i64
        };
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RemoteResponse::new(201, json!({ "id": 1000 + n }))))
    }
}

/// In-memory database, scripted transport and a valid credential
pub fn test_context(transport: Arc<ScriptedTransport>) -> (SyncContext, SharedCredential) {
    let credentials = SharedCredential::new(Some(Credential::bearer("test-token")));
    let ctx = SyncContext {
        db: Database::open_in_memory().unwrap(),
        store: Arc::new(RecordStore::new(PhotoStoreConfig::default())),
        notifier: Notifier::new(),
        credentials: Arc::new(credentials.clone()),
        transport,
        builder: Arc::new(ApiRequestBuilder),
    };
    (ctx, credentials)
}

/// A decodable JPEG of the given size
pub fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 255) as u8, (y % 255) as u8, 96])
    });
    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buffer, image::ImageFormat::Jpeg)
        .unwrap();
    buffer.into_inner()
}
