//! courier-dispatcher: Outbox dispatcher
//!
//! Runs a pool of claim dispatchers against the configured command store and
//! publishes outbox events to the configured broker until interrupted.
//!
//! ## Configuration
//! - First argument or COURIER_CONFIG: path to a YAML config file (optional)
//! - COURIER__SECTION__KEY: overrides any config value
//! - COURIER_LOG: tracing filter (default: info)
//!
//! Several processes may run against the same store; each worker id is unique.

use tracing::info;

use courier::config::Config;
use courier::dispatcher::{spawn_pool, Dispatcher, DispatcherSettings};
use courier::publisher;
use courier::storage::init_storage;
use courier::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let store = init_storage(&config.storage).await?;
    let publisher = publisher::from_config(&config.publisher)?;

    let stats = store.outbox_stats().await?;
    info!(
        pending = stats.pending,
        claimed = stats.claimed,
        published = stats.published,
        failed = stats.failed,
        "Outbox state at startup"
    );

    let dispatchers = (0..config.dispatcher.workers.max(1))
        .map(|index| {
            let worker_id =
                DispatcherSettings::worker_id_for(&config.dispatcher.worker_id_prefix, index);
            Dispatcher::new(
                store.clone(),
                publisher.clone(),
                DispatcherSettings::from_config(&config.dispatcher, worker_id),
            )
        })
        .collect();

    let handle = spawn_pool(dispatchers);
    info!(
        workers = handle.len(),
        publisher = publisher.name(),
        "courier-dispatcher started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    handle.shutdown().await;

    Ok(())
}
