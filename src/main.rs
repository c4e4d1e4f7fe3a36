/// Tagflow: flow execution engine for industrial tag telemetry
///
/// Main entry point for the Tagflow server. Initializes configuration and
/// starts the HTTP server with flow management and execution capabilities.

use tagflow::{config::Config, server::start_server};

/// Application entry point
///
/// Starts the server with default configuration. The server provides:
/// - Flow management API at /api/flows/*
/// - Trigger firing at /api/flows/{id}/triggers/{node_id}/fire
/// - Script validation at /api/scripts/validate
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
