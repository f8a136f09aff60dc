//! # Hook-Reconciler CLI
//!
//! Operator command-line interface for Hook-Reconciler.
//!
//! This module provides CLI commands for:
//! - Inspecting and replaying recorded webhook attempts through the admin API
//! - Computing provider signatures for hand-crafted test deliveries
//! - Validating a service configuration file before deployment

use clap::{Parser, Subcommand};
use hook_reconciler_api::{
    AttemptDetailResponse, AttemptListResponse, ConfigError as ServiceConfigError, RetryResponse,
    ServiceConfig,
};
use hook_reconciler_core::{
    signature, SignatureAlgorithm, SignatureScheme, VerificationContext, WebhookAttempt,
    WebhookSource,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

// ============================================================================
// CLI Structure
// ============================================================================

/// Hook-Reconciler CLI - operate the webhook reconciliation service
#[derive(Parser)]
#[command(name = "hook-reconciler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operate the Hook-Reconciler webhook service")]
pub struct Cli {
    /// Base URL of a running service
    #[arg(long, env = "HR_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "10")]
    pub timeout: u64,

    /// Logging level
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and replay webhook attempts
    Attempts {
        #[command(subcommand)]
        action: AttemptCommands,
    },

    /// Compute the signature header a provider would send for a body file
    Sign {
        /// Provider family (telephony, calendar, sms, reviews)
        #[arg(value_parser = parse_source)]
        provider: WebhookSource,

        /// File holding the exact request body
        file: PathBuf,

        /// Signing secret
        #[arg(short, long, env = "HR_SIGNING_SECRET", hide_env_values = true)]
        secret: String,

        /// Full URL the provider posts to (telephony)
        #[arg(short, long)]
        url: Option<String>,

        /// Signing timestamp (calendar); defaults to the current unix time
        #[arg(short, long)]
        timestamp: Option<String>,

        /// Digest for body-signed providers
        #[arg(short, long, value_enum, default_value = "sha256")]
        algorithm: AlgorithmArg,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

/// Attempt subcommands
#[derive(Subcommand)]
pub enum AttemptCommands {
    /// List recorded attempts, newest first
    List {
        /// Filter by provider family
        #[arg(long, value_parser = parse_source)]
        source: Option<WebhookSource>,

        /// Filter by status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<String>,

        /// Filter by tenant
        #[arg(long)]
        tenant: Option<String>,

        /// Only attempts created at or after this RFC3339 instant
        #[arg(long)]
        from: Option<String>,

        /// Only attempts created before this RFC3339 instant
        #[arg(long)]
        to: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "50")]
        per_page: u32,

        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Show one attempt including its stored payload
    Show {
        attempt_id: String,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Replay a failed attempt from its stored payload
    Retry { attempt_id: String },
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Load and validate a service configuration file
    Validate {
        /// YAML, TOML, or JSON file
        file: PathBuf,

        /// Also read secrets held in environment variables
        #[arg(long)]
        resolve_secrets: bool,
    },
}

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Fixed-width table
    Table,
    /// JSON output
    Json,
}

/// Digest choice for body-signed providers
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum AlgorithmArg {
    Sha1,
    Sha256,
}

impl From<AlgorithmArg> for SignatureAlgorithm {
    fn from(value: AlgorithmArg) -> Self {
        match value {
            AlgorithmArg::Sha1 => SignatureAlgorithm::HmacSha1,
            AlgorithmArg::Sha256 => SignatureAlgorithm::HmacSha256,
        }
    }
}

fn parse_source(value: &str) -> Result<WebhookSource, String> {
    value.parse::<WebhookSource>().map_err(|e| e.to_string())
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration file {path} could not be loaded: {message}")]
    ConfigLoad { path: PathBuf, message: String },

    #[error("Configuration is invalid: {0}")]
    ConfigInvalid(#[from] ServiceConfigError),

    #[error("Request to the service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service answered {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigLoad { .. } | Self::ConfigInvalid(_) => 1,
            Self::Http(_) => 2,
            Self::Api { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Admin API client
// ============================================================================

/// Filters for `GET /admin/attempts`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptFilter {
    pub source: Option<WebhookSource>,
    pub status: Option<String>,
    pub tenant: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: u32,
    pub per_page: u32,
}

/// Thin client for the service's `/admin` routes
pub struct AdminClient {
    base_url: reqwest::Url,
    http: reqwest::Client,
}

impl AdminClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CliError> {
        let base_url = reqwest::Url::parse(base_url).map_err(|e| CliError::InvalidArgument {
            arg: "--api-url".to_string(),
            message: e.to_string(),
        })?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, http })
    }

    /// URL of the attempt listing with the filter applied as query parameters
    pub fn attempts_url(&self, filter: &AttemptFilter) -> Result<reqwest::Url, CliError> {
        let mut url = self.endpoint("admin/attempts")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(source) = filter.source {
                query.append_pair("source", source.as_str());
            }
            for (name, value) in [
                ("status", &filter.status),
                ("tenant", &filter.tenant),
                ("from", &filter.from),
                ("to", &filter.to),
            ] {
                if let Some(value) = value {
                    query.append_pair(name, value);
                }
            }
            query.append_pair("page", &filter.page.to_string());
            query.append_pair("per_page", &filter.per_page.to_string());
        }
        Ok(url)
    }

    pub fn attempt_url(&self, attempt_id: &str) -> Result<reqwest::Url, CliError> {
        self.endpoint(&format!("admin/attempts/{attempt_id}"))
    }

    pub async fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<AttemptListResponse, CliError> {
        let url = self.attempts_url(filter)?;
        debug!(url = %url, "Listing attempts");
        let response = self.http.get(url).send().await?;
        decode(response).await
    }

    pub async fn get_attempt(&self, attempt_id: &str) -> Result<WebhookAttempt, CliError> {
        let response = self.http.get(self.attempt_url(attempt_id)?).send().await?;
        let detail: AttemptDetailResponse = decode(response).await?;
        Ok(detail.attempt)
    }

    pub async fn retry_attempt(&self, attempt_id: &str) -> Result<RetryResponse, CliError> {
        let url = self.endpoint(&format!("admin/attempts/{attempt_id}/retry"))?;
        let response = self.http.post(url).send().await?;
        decode(response).await
    }

    fn endpoint(&self, path: &str) -> Result<reqwest::Url, CliError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path).map_err(|e| CliError::InvalidArgument {
            arg: "--api-url".to_string(),
            message: e.to_string(),
        })
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, CliError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let body = response.text().await.unwrap_or_default();
    Err(CliError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

/// Pull the `error` field out of an admin error body, falling back to the raw text.
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

// ============================================================================
// Rendering
// ============================================================================

pub fn render_attempt_table(listing: &AttemptListResponse) -> String {
    let mut out = format!(
        "{:<26}  {:<15}  {:<10}  {:<12}  {:<16}  {:>7}  {}\n",
        "ID", "SOURCE", "STATUS", "FAILURE", "TENANT", "RETRIES", "CREATED"
    );
    for attempt in &listing.attempts {
        out.push_str(&format!(
            "{:<26}  {:<15}  {:<10}  {:<12}  {:<16}  {:>7}  {}\n",
            attempt.id,
            attempt.source,
            attempt.status,
            attempt
                .failure_kind
                .map(|k| k.as_str().to_string())
                .unwrap_or_else(|| "-".to_string()),
            attempt
                .tenant_id
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string()),
            attempt.retries,
            attempt.created_at.to_rfc3339(),
        ));
    }
    out.push_str(&format!(
        "page {} ({} per page), {} total{}\n",
        listing.page,
        listing.per_page,
        listing.total,
        if listing.has_more { ", more available" } else { "" }
    ));
    out
}

pub fn render_attempt_detail(attempt: &WebhookAttempt) -> String {
    let optional = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    let mut out = String::new();
    out.push_str(&format!("Attempt:      {}\n", attempt.id));
    out.push_str(&format!("Source:       {}\n", attempt.source));
    out.push_str(&format!("Event type:   {}\n", attempt.event_type));
    out.push_str(&format!("Status:       {}\n", attempt.status));
    out.push_str(&format!(
        "Failure:      {}\n",
        optional(attempt.failure_kind.map(|k| k.to_string()))
    ));
    out.push_str(&format!(
        "Error:        {}\n",
        optional(attempt.error_message.clone())
    ));
    out.push_str(&format!(
        "Tenant:       {}\n",
        optional(attempt.tenant_id.as_ref().map(|t| t.to_string()))
    ));
    out.push_str(&format!("Retries:      {}\n", attempt.retries));
    out.push_str(&format!(
        "Replay of:    {}\n",
        optional(attempt.replay_of.map(|id| id.to_string()))
    ));
    out.push_str(&format!(
        "Source IP:    {}\n",
        optional(attempt.source_ip.clone())
    ));
    out.push_str(&format!("Created:      {}\n", attempt.created_at));
    out.push_str(&format!(
        "Processed:    {}\n",
        optional(attempt.processed_at.map(|t| t.to_string()))
    ));
    out.push_str("Payload:\n");
    out.push_str(
        &serde_json::to_string_pretty(&attempt.raw_payload)
            .unwrap_or_else(|_| attempt.raw_payload.to_string()),
    );
    out.push('\n');
    out
}

// ============================================================================
// Signing
// ============================================================================

/// Header lines a provider would attach to `body`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub headers: Vec<(&'static str, String)>,
}

/// Name of the header carrying the signature for a provider family
pub fn signature_header(source: WebhookSource) -> &'static str {
    match source {
        WebhookSource::Telephony => "X-Telephony-Signature",
        WebhookSource::Calendar => "X-Calendar-Signature",
        WebhookSource::SmsDelivery => "X-Sms-Signature",
        WebhookSource::ReviewPlatform => "X-Review-Signature",
    }
}

pub fn sign_body(
    source: WebhookSource,
    body: &[u8],
    secret: &str,
    url: Option<String>,
    timestamp: Option<String>,
    algorithm: SignatureAlgorithm,
) -> Result<SignedHeaders, CliError> {
    if secret.is_empty() {
        return Err(CliError::InvalidArgument {
            arg: "--secret".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    let scheme = SignatureScheme::for_source(source, algorithm);
    let mut headers = Vec::new();
    let context = match scheme {
        SignatureScheme::UrlAndBody => {
            let url = url.ok_or_else(|| CliError::InvalidArgument {
                arg: "--url".to_string(),
                message: "telephony signatures cover the full request URL".to_string(),
            })?;
            VerificationContext::with_url(url)
        }
        SignatureScheme::TimestampAndBody => {
            let timestamp =
                timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp().to_string());
            headers.push(("X-Calendar-Timestamp", timestamp.clone()));
            VerificationContext::with_timestamp(timestamp)
        }
        SignatureScheme::Body { .. } => VerificationContext::default(),
    };

    let value = signature::sign(&scheme, body, secret, &context).ok_or_else(|| {
        CliError::InvalidArgument {
            arg: "provider".to_string(),
            message: "signature could not be computed".to_string(),
        }
    })?;
    headers.insert(0, (signature_header(source), value));

    Ok(SignedHeaders { headers })
}

// ============================================================================
// Configuration validation
// ============================================================================

/// Load a service configuration file; the format follows the file extension.
pub fn load_service_config(path: &Path) -> Result<ServiceConfig, CliError> {
    let load_error = |message: String| CliError::ConfigLoad {
        path: path.to_path_buf(),
        message,
    };

    if !path.exists() {
        return Err(load_error("file does not exist".to_string()));
    }

    config::Config::builder()
        .add_source(config::File::from(path).required(true))
        .build()
        .map_err(|e| load_error(e.to_string()))?
        .try_deserialize::<ServiceConfig>()
        .map_err(|e| load_error(e.to_string()))
}

/// Validate a configuration file and describe what it configures.
pub fn validate_config_file(path: &Path, resolve_secrets: bool) -> Result<String, CliError> {
    let config = load_service_config(path)?;
    config.validate()?;
    if resolve_secrets {
        config.pipeline_config()?;
    }

    let providers: Vec<&str> = config
        .providers
        .entries()
        .map(|(source, _)| source.as_str())
        .collect();
    Ok(format!(
        "{} is valid: listening on {}:{}, providers [{}], {} tenant(s)",
        path.display(),
        config.server.host,
        config.server.port,
        providers.join(", "),
        config.tenants.len()
    ))
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli);
    execute(cli).await
}

fn initialize_logging(cli: &Cli) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hook_reconciler_cli={}", cli.log_level)));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Run an already-parsed command.
pub async fn execute(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Attempts { action } => {
            let client = AdminClient::new(&cli.api_url, Duration::from_secs(cli.timeout))?;
            execute_attempts_command(&client, action).await
        }
        Commands::Sign {
            provider,
            file,
            secret,
            url,
            timestamp,
            algorithm,
        } => {
            let body = std::fs::read(&file)?;
            info!(provider = %provider, bytes = body.len(), "Signing body");
            let signed = sign_body(provider, &body, &secret, url, timestamp, algorithm.into())?;
            for (name, value) in signed.headers {
                println!("{name}: {value}");
            }
            Ok(())
        }
        Commands::Config {
            action:
                ConfigCommands::Validate {
                    file,
                    resolve_secrets,
                },
        } => {
            println!("{}", validate_config_file(&file, resolve_secrets)?);
            Ok(())
        }
    }
}

async fn execute_attempts_command(
    client: &AdminClient,
    action: AttemptCommands,
) -> Result<(), CliError> {
    match action {
        AttemptCommands::List {
            source,
            status,
            tenant,
            from,
            to,
            page,
            per_page,
            format,
        } => {
            let filter = AttemptFilter {
                source,
                status,
                tenant,
                from,
                to,
                page,
                per_page,
            };
            let listing = client.list_attempts(&filter).await?;
            match format {
                OutputFormat::Json => println!("{}", to_json(&listing)),
                OutputFormat::Table | OutputFormat::Text => {
                    print!("{}", render_attempt_table(&listing))
                }
            }
        }
        AttemptCommands::Show { attempt_id, format } => {
            let attempt = client.get_attempt(&attempt_id).await?;
            match format {
                OutputFormat::Json => println!("{}", to_json(&attempt)),
                OutputFormat::Table | OutputFormat::Text => {
                    print!("{}", render_attempt_detail(&attempt))
                }
            }
        }
        AttemptCommands::Retry { attempt_id } => {
            let result = client.retry_attempt(&attempt_id).await?;
            println!("{}", result.message);
            if let Some(id) = result.attempt_id {
                println!("replay attempt: {id}");
            }
            if !result.success {
                return Err(CliError::Api {
                    status: 200,
                    message: format!(
                        "replay of {} failed ({})",
                        result.replay_of,
                        result.failure_kind.as_deref().unwrap_or("unknown")
                    ),
                });
            }
        }
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
