//! tagfeed: ingests tagging events into the feeder log and reruns the
//! highest-ranked tagbox scores on a fixed interval.

use std::path::Path;
use std::sync::Arc;

use tagfeed::config::Config;
use tagfeed::db::Database;
use tagfeed::scheduler::{Scheduler, SchedulerConfig};
use tagfeed::tagbox::loader::register_manifests;
use tagfeed::SiteContext;
use tokio::sync::oneshot;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();

    log::info!("Opening database at: {}", config.database_url);
    let db = Arc::new(Database::with_pool_size(&config.database_url, config.pool_size)?);

    let registered = register_manifests(&db, Path::new(&config.tagbox_dir))?;
    log::info!(
        "Registered {} tagboxes from {}",
        registered.len(),
        config.tagbox_dir
    );

    let site = Arc::new(SiteContext::new(db));
    let scheduler = Arc::new(Scheduler::new(site, SchedulerConfig::from(&config)));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = tokio::spawn(scheduler.start(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested");
    let _ = shutdown_tx.send(());
    handle.await?;

    Ok(())
}
