//! Startup helpers: configuration layering and log initialisation.

use anyhow::Context;
use hook_reconciler_api::{LoggingConfig, ServiceConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// System-wide configuration file, loaded first when present.
pub const SYSTEM_CONFIG_FILE: &str = "/etc/hook-reconciler/service";

/// Deployment-local configuration file, relative to the working directory.
pub const LOCAL_CONFIG_FILE: &str = "config/service";

/// Variable naming an operator-supplied configuration file.
pub const CONFIG_FILE_ENV: &str = "HR_CONFIG_FILE";

/// Prefix of configuration override variables, e.g. `HR__SERVER__PORT=9090`.
pub const ENV_PREFIX: &str = "HR";

/// Build the service configuration from files and the environment.
///
/// Later sources override earlier ones:
///  1. `/etc/hook-reconciler/service.yaml`
///  2. `./config/service.yaml`
///  3. the file named by `HR_CONFIG_FILE` (must exist when set)
///  4. `HR__`-prefixed environment variables, `__` separating path segments
///
/// Absent optional files leave the defaults in place. A malformed file or a
/// value of the wrong type is an error.
pub fn load_config(base_files: &[&str]) -> anyhow::Result<ServiceConfig> {
    let mut builder = config::Config::builder();
    for file in base_files {
        builder = builder.add_source(
            config::File::with_name(file)
                .required(false)
                .format(config::FileFormat::Yaml),
        );
    }

    if let Some(explicit_path) = std::env::var(CONFIG_FILE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
    {
        builder = builder.add_source(
            config::File::with_name(&explicit_path)
                .required(true)
                .format(config::FileFormat::Yaml),
        );
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("failed to build configuration")?;

    settings
        .try_deserialize::<ServiceConfig>()
        .context("could not deserialize service configuration")
}

/// Filter applied when `RUST_LOG` is unset.
pub fn default_filter(logging: &LoggingConfig) -> String {
    let level = &logging.level;
    ["hook_reconciler_service", "hook_reconciler_api", "hook_reconciler_core"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .chain(std::iter::once("tower_http=info".to_string()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install the global tracing subscriber.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(logging)));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
#[path = "bootstrap_tests.rs"]
mod tests;
