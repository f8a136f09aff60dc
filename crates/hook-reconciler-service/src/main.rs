//! # Hook-Reconciler Service
//!
//! Binary entry point for the Hook-Reconciler HTTP service.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes structured logging
//! - Wires the webhook pipeline with in-memory stores
//! - Starts the HTTP server from hook-reconciler-api

mod bootstrap;

use bootstrap::{init_tracing, load_config, LOCAL_CONFIG_FILE, SYSTEM_CONFIG_FILE};
use hook_reconciler_api::{start_server, ServiceError};
use hook_reconciler_core::{BusinessStores, InMemoryAttemptStore, LoggingNotificationSink};
use std::sync::Arc;
use tracing::{error, info};

/// Exit code for configuration problems detected before the server starts.
const EXIT_CONFIGURATION: i32 = 3;

#[tokio::main]
async fn main() {
    let service_config = match load_config(&[SYSTEM_CONFIG_FILE, LOCAL_CONFIG_FILE]) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not set up yet, so the error goes straight to stderr.
            eprintln!("hook-reconciler-service: {e:#}");
            std::process::exit(EXIT_CONFIGURATION);
        }
    };

    init_tracing(&service_config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Hook-Reconciler Service");

    if let Err(e) = service_config.validate() {
        error!(error = %e, "Service configuration is invalid; aborting");
        std::process::exit(EXIT_CONFIGURATION);
    }

    let pipeline = match service_config.build_pipeline(
        BusinessStores::in_memory(),
        Arc::new(InMemoryAttemptStore::new()),
        Arc::new(LoggingNotificationSink),
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Failed to wire webhook pipeline; aborting");
            std::process::exit(EXIT_CONFIGURATION);
        }
    };

    for (source, _) in service_config.providers.entries() {
        info!(provider = %source, "Provider signing configured");
    }
    info!(
        tenants = service_config.tenants.len(),
        host = %service_config.server.host,
        port = service_config.server.port,
        "Starting HTTP server"
    );

    if let Err(e) = start_server(service_config, pipeline).await {
        error!(error = %e, "Server terminated with an error");

        let exit_code = match e {
            ServiceError::BindFailed { .. } => 1,
            ServiceError::ServerFailed { .. } => 2,
            ServiceError::Configuration(_) => EXIT_CONFIGURATION,
            ServiceError::Metrics(_) => 4,
        };
        std::process::exit(exit_code);
    }

    info!("Hook-Reconciler Service stopped");
}
