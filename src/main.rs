/// stagestore: checkpoint storage for multi-model workflow runs
///
/// Main entry point for the stagestore server. Loads configuration, reclaims leftovers
/// of crashed sessions and starts the HTTP admin API.

use stagestore::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Session administration API at /api/sessions/*
/// - Manifest inspection at /api/manifest/sessions
/// - Health check at /healthz
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (defaults to 0.0.0.0:3005 and ./data)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
