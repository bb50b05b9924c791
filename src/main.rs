use fieldsync::services::{
    ApiRequestBuilder, BackgroundSync, Credential, HttpTransport, SharedCredential,
};
use fieldsync::{AppError, Database, SyncConfig, SyncEngine, SyncEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("fieldsync failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = SyncConfig::from_env()?;
    let db = Database::open(&config.database_path)?;

    let credentials = SharedCredential::new(config.api_token.clone().map(Credential::bearer));
    if config.api_token.is_none() {
        log::warn!("No api_token configured, uploads stay paused");
    }

    let engine = Arc::new(SyncEngine::new(
        db,
        &config,
        Arc::new(HttpTransport::new(&config)?),
        Arc::new(ApiRequestBuilder),
        Arc::new(credentials),
    ));

    let applied = engine.run_migrations()?;
    if !applied.is_empty() {
        log::info!("Applied migrations: {:?}", applied);
    }

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::RecordChanged { uuid }) => {
                    log::debug!("Observation {} changed", uuid)
                }
                Ok(SyncEvent::CredentialsStale) => {
                    log::warn!("Credentials rejected, provide a fresh api_token")
                }
                Ok(SyncEvent::Monitoring { uuid, message }) => {
                    log::error!("Sync of {} failed: {}", uuid, message)
                }
                Err(RecvError::Lagged(skipped)) => log::warn!("Missed {} sync events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let background = BackgroundSync::new(Arc::clone(&engine), &config);
    background.start();

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    background.stop();
    background.wait_stopped().await;
    Ok(())
}
