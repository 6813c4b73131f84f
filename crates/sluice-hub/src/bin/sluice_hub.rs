//! Sluice hub service.

use std::sync::Arc;

use sluice_core::observability::{init_logging, LogFormat};
use sluice_hub::config::HubConfig;
use sluice_hub::error::Result;
use sluice_hub::executor::MutationExecutor;
use sluice_hub::governor::VelocityGovernor;
use sluice_hub::server::HubServer;
use sluice_hub::store::StepStore;
use sluice_hub::txqueue::TransactionQueue;

fn log_format_from_env() -> LogFormat {
    match std::env::var("SLUICE_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let config = HubConfig::from_env()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        db = %config.db_path.display(),
        queue = %config.queue_dir.display(),
        "starting hub"
    );

    let store = Arc::new(StepStore::open(&config.db_path)?);
    let queue = Arc::new(TransactionQueue::open(&config.queue_dir)?);
    let bucket = config.bucket.build();
    let governor = Arc::new(VelocityGovernor::new(store.tag_limits()?));

    tokio::spawn(Arc::clone(&governor).run());

    let executor = MutationExecutor::new(store.clone(), bucket.clone(), queue.clone());
    tokio::spawn(async move { executor.run().await });

    let server = Arc::new(HubServer::new(
        config.host.clone(),
        config.port,
        store,
        governor,
        bucket,
        queue,
    ));
    server.serve().await
}
