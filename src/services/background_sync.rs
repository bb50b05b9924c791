use crate::config::SyncConfig;
use crate::error::AppError;
use crate::services::sync_engine::{SyncEngine, SyncStats};
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const SYNC_LOG_CAP: usize = 500;

/// In-memory session log entry (volatile, lost on restart)
#[derive(Debug, Clone, PartialEq)]
pub struct SyncLogEntry {
    pub ts_ms: i64,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub error: Option<String>,
}

/// Periodic sync loop around one `SyncEngine`
pub struct BackgroundSync {
    engine: Arc<SyncEngine>,
    interval: Duration,
    retry_delay: Duration,
    enabled: Arc<AtomicBool>,
    next_sync_at: Arc<AtomicU64>,
    log: Arc<Mutex<Vec<SyncLogEntry>>>,
    stop: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundSync {
    pub fn new(engine: Arc<SyncEngine>, config: &SyncConfig) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(config.sync_interval_secs),
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            enabled: Arc::new(AtomicBool::new(false)),
            next_sync_at: Arc::new(AtomicU64::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
            stop: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Starts the loop. The first cycle runs right away; later ones run on the
    /// interval or as soon as a save wakes the engine.
    pub fn start(&self) {
        if self.enabled.swap(true, Ordering::SeqCst) {
            log::warn!("Background sync already running");
            return;
        }

        log::info!(
            "Starting background sync with {} second interval",
            self.interval.as_secs()
        );

        let engine = Arc::clone(&self.engine);
        let wake = engine.wake_handle();
        let enabled = Arc::clone(&self.enabled);
        let next_sync_at = Arc::clone(&self.next_sync_at);
        let log_store = Arc::clone(&self.log);
        let stop = Arc::clone(&self.stop);
        let (interval, retry_delay) = (self.interval, self.retry_delay);

        let handle = tokio::spawn(async move {
            while enabled.load(Ordering::SeqCst) {
                let result = engine.sync_now().await;
                append_log(&log_store, &result);

                let delay = match &result {
                    Ok(stats) if !stats.deferred && !stats.credentials_stale => {
                        log::debug!("Background sync completed: {:?}", stats);
                        interval
                    }
                    Ok(stats) => {
                        log::warn!("Background sync deferred: {:?}", stats);
                        with_jitter(retry_delay)
                    }
                    Err(e) => {
                        log::error!("Background sync error: {}", e);
                        with_jitter(retry_delay)
                    }
                };

                next_sync_at.store(now_ms() + delay.as_millis() as u64, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wake.notified() => log::debug!("Background sync woken early"),
                    _ = stop.notified() => {}
                }
            }
            next_sync_at.store(0, Ordering::SeqCst);
            log::info!("Background sync stopped");
        });

        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Asks the loop to stop after the current cycle
    pub fn stop(&self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            log::info!("Stopping background sync");
            self.stop.notify_one();
        }
    }

    /// Waits for a stopped loop to finish its last cycle
    pub async fn wait_stopped(&self) {
        let handle = self.handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Background sync task failed: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn next_sync_eta_seconds(&self) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        let now = now_ms();
        let target = self.next_sync_at.load(Ordering::SeqCst);
        if target == 0 || target <= now {
            Some(0)
        } else {
            Some((target - now) / 1000)
        }
    }

    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        self.log.lock().map(|guard| guard.clone()).unwrap_or_default()
    }
}

fn append_log(store: &Mutex<Vec<SyncLogEntry>>, result: &Result<SyncStats, AppError>) {
    let entry = match result {
        Ok(stats) => SyncLogEntry {
            ts_ms: Utc::now().timestamp_millis(),
            claimed: stats.claimed,
            sent: stats.sent,
            failed: stats.failed,
            error: None,
        },
        Err(e) => SyncLogEntry {
            ts_ms: Utc::now().timestamp_millis(),
            claimed: 0,
            sent: 0,
            failed: 0,
            error: Some(e.to_string()),
        },
    };

    if let Ok(mut guard) = store.lock() {
        guard.push(entry);
        let len = guard.len();
        if len > SYNC_LOG_CAP {
            guard.drain(0..len - SYNC_LOG_CAP);
        }
    }
}

/// `delay` plus up to a quarter of it
fn with_jitter(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    let jitter = rand::rng().random_range(0..=delay_ms / 4);
    Duration::from_millis(delay_ms + jitter)
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
