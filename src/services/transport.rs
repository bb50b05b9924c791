//! Remote calls. The queue only needs `RemoteTransport`; `HttpTransport` is
//! the reqwest implementation used by the binary.

use crate::config::SyncConfig;
use crate::error::AppError;
use crate::services::credentials::Credential;
use async_trait::async_trait;
use photo_store::PhotoBlob;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// Multipart upload: the file part plus plain text fields
    Photo {
        blob: PhotoBlob,
        file_name: String,
        fields: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    pub method: HttpMethod,
    /// Path relative to the server url, or an absolute url
    pub path: String,
    pub body: RequestBody,
}

impl RemoteRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method,
            path: path.into(),
            body,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path, RequestBody::Empty)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Value,
}

impl RemoteResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Status handle of an asynchronously processed request
    pub fn status_url(&self) -> Option<String> {
        if self.status != 202 {
            return None;
        }
        self.body
            .get("status_url")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn remote_id(&self) -> Option<i64> {
        self.body.get("id").and_then(Value::as_i64)
    }

    /// Best-effort human readable error text from the body
    pub fn message(&self) -> String {
        for key in ["error", "message", "errors"] {
            match self.body.get(key) {
                Some(Value::String(s)) => return s.clone(),
                Some(other) if !other.is_null() => return other.to_string(),
                _ => {}
            }
        }
        match &self.body {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Null => format!("HTTP {}", self.status),
            other => other.to_string(),
        }
    }
}

/// Maps a response onto the error taxonomy. 2xx passes through.
pub fn classify(response: RemoteResponse) -> Result<RemoteResponse, AppError> {
    match response.status {
        200..=299 => Ok(response),
        401 => Err(AppError::Auth),
        400..=499 => Err(AppError::Client {
            status: response.status,
            message: response.message(),
        }),
        status => Err(AppError::Server {
            status,
            message: response.message(),
        }),
    }
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Sends one request. `Err` only when no response arrived.
    async fn execute(
        &self,
        request: RemoteRequest,
        credential: &Credential,
    ) -> Result<RemoteResponse, AppError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

fn network_error(e: reqwest::Error, url: &str) -> AppError {
    if e.is_timeout() {
        AppError::Network(format!("Timeout for {}", url))
    } else if e.is_connect() {
        AppError::Network(format!("Connection to {} failed: {}", url, e))
    } else {
        AppError::Network(format!("Request to {} failed: {}", url, e))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn execute(
        &self,
        request: RemoteRequest,
        credential: &Credential,
    ) -> Result<RemoteResponse, AppError> {
        let url = self.url_for(&request.path);
        let builder = match request.method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Delete => self.client.delete(&url),
        }
        .header(reqwest::header::AUTHORIZATION, credential.header_value());

        let builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Photo {
                blob,
                file_name,
                fields,
            } => {
                let part = reqwest::multipart::Part::bytes(blob.bytes)
                    .file_name(file_name)
                    .mime_str(&blob.mime)
                    .map_err(|e| AppError::Validation(format!("Bad photo mime type: {}", e)))?;
                let mut form = reqwest::multipart::Form::new();
                for (key, value) in fields {
                    form = form.text(key, value);
                }
                builder.multipart(form.part("file", part))
            }
        };

        let response = builder.send().await.map_err(|e| network_error(e, &url))?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| network_error(e, &url))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        log::debug!("{:?} {} -> {}", request.method, url, status);
        Ok(RemoteResponse { status, body })
    }
}
