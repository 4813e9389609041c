//! Ferry Sync daemon - keeps a local store replicated with CouchDB.
//!
//! Opens the store under `FERRY_STORE_DIR`, starts replication for the
//! configured user and runs until interrupted.

use ferry_engine::{FileBackend, StorageBackend, Store};
use ferry_sync::{ReplicationOptions, SyncConfig, SyncCoordinator};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_sync=debug,ferry_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    tracing::info!(
        store = %config.store_name,
        dir = %config.store_dir.display(),
        remote = %config.remote_url,
        "Starting Ferry sync daemon"
    );

    // Open the local store
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(config.store_dir.clone()));
    let mut builder = Store::builder(config.store_name.clone(), backend)
        .password_opt(config.store_password.clone());
    for schema in config.schemas()? {
        builder = builder.collection(schema);
    }
    let store = builder.open_with_recovery(config.recovery_mode)?;
    tracing::info!(collections = ?store.collections(), "Store opened");

    // Start replication
    let mut coordinator = SyncCoordinator::new(store)
        .with_db_prefix(config.db_prefix.clone())
        .with_merge_strategy(config.merge_strategy)
        .with_options(ReplicationOptions {
            batch_size: config.batch_size,
            pull_interval: config.pull_interval,
            live: true,
        });
    if let Some(admin) = config.admin_credentials.clone() {
        coordinator = coordinator.with_provisioning(admin);
    }
    let coordinator = Arc::new(coordinator);

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(?event, "Replication event"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event log fell behind")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    coordinator
        .start(&config.user_id, &config.remote_url, config.credentials.clone())
        .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    coordinator.stop().await;

    Ok(())
}
