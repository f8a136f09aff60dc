//! Configuration types for the HTTP service
//!
//! Every field carries a serde default so an empty file or environment yields
//! a runnable (if provider-less) service. [`ServiceConfig::validate`] catches
//! deliberate-but-broken settings at startup.

use crate::errors::ConfigError;
use hook_reconciler_core::{
    pipeline::DEFAULT_TIMESTAMP_TOLERANCE, AttemptStore, AuditLog, BusinessResolver,
    BusinessStores, InMemoryTenantDirectory, NotificationEmitter, NotificationSink,
    PipelineConfig, Reconciler, SignatureAlgorithm, TenantRecord, WebhookPipeline, WebhookSecret,
    WebhookSource,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

/// Service configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server settings
    pub server: ServerConfig,

    /// Webhook processing settings
    pub webhooks: WebhookConfig,

    /// Per-provider signing secrets
    pub providers: ProvidersConfig,

    /// Tenant lookup table seeding the in-memory directory
    pub tenants: Vec<TenantRecord>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,

    /// Maximum webhook body size in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_seconds: 30,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// Webhook processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Externally visible base URL, used to rebuild the signed URL of
    /// telephony callbacks when the service sits behind a proxy
    pub public_base_url: Option<String>,

    /// Acceptance window for signed calendar timestamps
    pub timestamp_tolerance_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            public_base_url: None,
            timestamp_tolerance_seconds: DEFAULT_TIMESTAMP_TOLERANCE.as_secs(),
        }
    }
}

/// Signing configuration, one optional entry per provider family
///
/// A provider without an entry has every delivery rejected as unauthenticated.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub telephony: Option<ProviderConfig>,
    pub calendar: Option<ProviderConfig>,
    pub sms: Option<ProviderConfig>,
    pub reviews: Option<ProviderConfig>,
}

impl ProvidersConfig {
    /// Configured providers paired with the source they sign for
    pub fn entries(&self) -> impl Iterator<Item = (WebhookSource, &ProviderConfig)> {
        [
            (WebhookSource::Telephony, self.telephony.as_ref()),
            (WebhookSource::Calendar, self.calendar.as_ref()),
            (WebhookSource::SmsDelivery, self.sms.as_ref()),
            (WebhookSource::ReviewPlatform, self.reviews.as_ref()),
        ]
        .into_iter()
        .filter_map(|(source, config)| config.map(|c| (source, c)))
    }
}

/// Signing material for a single provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub secret: SecretSource,

    /// HMAC digest for body-signed providers (SMS delivery, reviews)
    #[serde(default)]
    pub algorithm: SignatureAlgorithm,
}

/// Where a signing secret comes from
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretSource {
    /// Secret written directly in the configuration
    Literal { value: Zeroizing<String> },

    /// Secret read from an environment variable at startup
    Env { variable: String },
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal { .. } => f
                .debug_struct("Literal")
                .field("value", &"<REDACTED>")
                .finish(),
            Self::Env { variable } => f.debug_struct("Env").field("variable", variable).finish(),
        }
    }
}

impl SecretSource {
    pub fn validate(&self, provider: &str) -> Result<(), ConfigError> {
        let problem = match self {
            Self::Literal { value } if value.trim().is_empty() => "literal secret is empty",
            Self::Env { variable } if variable.trim().is_empty() => {
                "environment variable name is empty"
            }
            _ => return Ok(()),
        };
        Err(ConfigError::ProviderValidation {
            provider: provider.to_string(),
            message: problem.to_string(),
        })
    }

    /// Materialise the secret.
    pub fn resolve(&self, provider: &str) -> Result<WebhookSecret, ConfigError> {
        let secret = match self {
            Self::Literal { value } => WebhookSecret::new(value.as_str()),
            Self::Env { variable } => std::env::var(variable)
                .ok()
                .filter(|v| !v.is_empty())
                .map(WebhookSecret::new)
                .ok_or_else(|| ConfigError::SecretUnavailable {
                    provider: provider.to_string(),
                    variable: variable.clone(),
                })?,
        };
        Ok(secret)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl ServiceConfig {
    /// Check settings that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                message: "server.port must be non-zero".to_string(),
            });
        }
        if self.server.max_body_size == 0 {
            return Err(ConfigError::Invalid {
                message: "server.max_body_size must be non-zero".to_string(),
            });
        }
        if self.webhooks.timestamp_tolerance_seconds == 0 {
            return Err(ConfigError::Invalid {
                message: "webhooks.timestamp_tolerance_seconds must be non-zero".to_string(),
            });
        }
        if let Some(base) = &self.webhooks.public_base_url {
            if !(base.starts_with("https://") || base.starts_with("http://")) {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "webhooks.public_base_url must be an absolute http(s) URL, got '{base}'"
                    ),
                });
            }
        }

        for (source, provider) in self.providers.entries() {
            provider.secret.validate(source.as_str())?;
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if !seen.insert(tenant.id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("tenant '{}' is listed more than once", tenant.id),
                });
            }
        }
        InMemoryTenantDirectory::from_records(&self.tenants)?;

        Ok(())
    }

    pub fn timestamp_tolerance(&self) -> Duration {
        Duration::from_secs(self.webhooks.timestamp_tolerance_seconds)
    }

    /// Resolve every provider secret into the pipeline's signing table.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = PipelineConfig::new().with_timestamp_tolerance(self.timestamp_tolerance());
        for (source, provider) in self.providers.entries() {
            let secret = provider.secret.resolve(source.as_str())?;
            config = config.with_provider(source, secret, provider.algorithm);
        }
        Ok(config)
    }

    /// Wire a pipeline from this configuration and the given collaborators.
    pub fn build_pipeline(
        &self,
        stores: BusinessStores,
        attempts: Arc<dyn AttemptStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<WebhookPipeline, ConfigError> {
        let directory = InMemoryTenantDirectory::from_records(&self.tenants)?;
        Ok(WebhookPipeline::new(
            self.pipeline_config()?,
            BusinessResolver::new(Arc::new(directory)),
            Reconciler::new(stores),
            AuditLog::new(attempts),
            NotificationEmitter::new(sink),
        ))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
