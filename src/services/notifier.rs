use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// Out-of-band messages for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Refresh your view of this record
    RecordChanged { uuid: Uuid },
    /// A drain stopped on 401 or a missing credential
    CredentialsStale,
    /// A background failure the original caller can no longer be told about
    Monitoring { uuid: Uuid, message: String },
}

#[derive(Clone)]
pub struct Notifier {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Sending without subscribers is fine
    pub fn send(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn record_changed(&self, uuid: Uuid) {
        self.send(SyncEvent::RecordChanged { uuid });
    }

    pub fn monitoring(&self, uuid: Uuid, message: impl Into<String>) {
        let message = message.into();
        log::warn!("Observation {}: {}", uuid, message);
        self.send(SyncEvent::Monitoring { uuid, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();
        let uuid = Uuid::new_v4();

        notifier.record_changed(uuid);
        notifier.send(SyncEvent::CredentialsStale);

        assert_eq!(rx.recv().await.unwrap(), SyncEvent::RecordChanged { uuid });
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::CredentialsStale);
    }
}
