//! Stratum daemon: hosts the periodic outer consolidation loop.
//!
//! Configuration via environment:
//! - `STRATUM_DATA`  — surrealkv path for durable storage (in-memory if unset)
//! - `STRATUM_SCOPE` — consolidation scope (default "default")
//! - `STRATUM_LOG_FORMAT=json` — newline-delimited JSON log output

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, Level};

use stratum_core::{
    CancelFlag, EngineConfig, RetentionEngine, SurrealDocStore, SystemClock,
};

#[tokio::main]
async fn main() -> Result<()> {
    let json = std::env::var("STRATUM_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    stratum_core::init_tracing(json, Level::INFO);

    let config = EngineConfig::default();
    let interval = Duration::from_secs(config.consolidation_interval_secs);
    let scope = std::env::var("STRATUM_SCOPE").unwrap_or_else(|_| "default".to_string());

    let engine = match std::env::var("STRATUM_DATA") {
        Ok(path) => {
            info!(path, "using durable surrealkv storage");
            let docs = SurrealDocStore::on_disk(&path).await?;
            RetentionEngine::new(config, Arc::new(docs), Arc::new(SystemClock))
        }
        Err(_) => {
            info!("using in-memory storage");
            RetentionEngine::in_memory(config)
        }
    };

    let hydrated = engine.hydrate().await?;
    info!(hydrated, scope, interval_secs = interval.as_secs(), "stratumd started");

    let cancel = CancelFlag::new();
    let outer = engine
        .orchestrator()
        .spawn_outer_loop(scope, interval, cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();
    outer.abort();
    Ok(())
}
