//! Current bearer credential, refreshed out of band by the embedding app.

use std::sync::{Arc, RwLock};

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential").field("token", &"***").finish()
    }
}

/// Read side used by the queue worker and the poller. Each request reads
/// the latest value right before it is sent.
pub trait CredentialProvider: Send + Sync {
    fn current(&self) -> Option<Credential>;
}

/// Swappable credential slot
#[derive(Clone, Default)]
pub struct SharedCredential {
    inner: Arc<RwLock<Option<Credential>>>,
}

impl SharedCredential {
    pub fn new(initial: Option<Credential>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn set(&self, credential: Option<Credential>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = credential,
            Err(poisoned) => *poisoned.into_inner() = credential,
        }
        log::debug!("Credential replaced");
    }
}

impl CredentialProvider for SharedCredential {
    fn current(&self) -> Option<Credential> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
