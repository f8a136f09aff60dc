//! # Hook-Reconciler Core
//!
//! Core business logic for the Hook-Reconciler webhook ingestion service.
//!
//! This crate authenticates inbound provider webhooks (telephony, calendar,
//! SMS delivery, review platforms), validates their payloads into typed
//! envelopes, resolves the owning tenant, reconciles the event against the
//! tenant's business entities exactly once, and records every attempt in an
//! audit log.
//!
//! ## Architecture
//!
//! The pipeline is an explicit sequence of stages:
//!
//! ```text
//! raw request -> signature -> schema -> resolver -> reconciler -> audit -> notify
//! ```
//!
//! - CPU-only stages (signature, schema) run before any store access
//! - Business logic depends only on trait abstractions (`store`, `audit`, `notify`)
//! - Infrastructure implementations are injected at runtime
//!
//! ## Usage
//!
//! ```rust
//! use hook_reconciler_core::{AttemptId, TenantId, WebhookSource};
//!
//! let attempt_id = AttemptId::new();
//! let tenant = TenantId::new("acme-dental").unwrap();
//! let source: WebhookSource = "telephony".parse().unwrap();
//! assert_eq!(source.event_type(), "call-status-update");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// Re-export commonly used types
pub use ulid::Ulid;
pub use uuid::Uuid;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Unique identifier for a webhook delivery attempt
///
/// Uses ULID so attempts sort by arrival time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttemptId(Ulid);

impl AttemptId {
    /// Generate a new unique attempt ID
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Get string representation of attempt ID
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AttemptId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ulid = s.parse::<Ulid>().map_err(|_| ParseError::InvalidFormat {
            expected: "ULID format".to_string(),
            actual: s.to_string(),
        })?;
        Ok(Self(ulid))
    }
}

/// Identifier of an isolated business account
///
/// Every entity and every webhook effect is scoped to exactly one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Create new tenant ID with validation
    ///
    /// # Validation Rules
    /// - Must be 1-128 characters
    /// - Must contain only ASCII alphanumerics, hyphens, and underscores
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "tenant_id".to_string(),
            });
        }

        if value.len() > 128 {
            return Err(ValidationError::TooLong {
                field: "tenant_id".to_string(),
                max_length: 128,
            });
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidCharacters {
                field: "tenant_id".to_string(),
                invalid_chars: "non-alphanumeric except hyphens and underscores".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Internal identifier of a reconciled business entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(Uuid);

impl EntityId {
    /// Generate new entity ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier tying together the log lines of one request
///
/// Callers may supply their own; values that are empty, longer than
/// [`CorrelationId::MAX_LENGTH`] or not printable ASCII are replaced with a
/// fresh UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub const MAX_LENGTH: usize = 128;

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Keep a caller-supplied id, or generate one when it is absent or unusable
    pub fn from_inbound(value: Option<&str>) -> Self {
        value
            .map(str::trim)
            .filter(|v| {
                !v.is_empty()
                    && v.len() <= Self::MAX_LENGTH
                    && v.bytes().all(|b| b.is_ascii_graphic())
            })
            .map(|v| Self(v.to_string()))
            .unwrap_or_else(Self::generate)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Webhook Source
// ============================================================================

/// External provider family that sent a webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WebhookSource {
    /// Voice provider call status callbacks
    Telephony,
    /// Calendar push notifications for synced events
    Calendar,
    /// SMS delivery receipts
    SmsDelivery,
    /// Review platform notifications
    ReviewPlatform,
}

impl WebhookSource {
    /// All sources, in routing order
    pub const ALL: [WebhookSource; 4] = [
        Self::Telephony,
        Self::Calendar,
        Self::SmsDelivery,
        Self::ReviewPlatform,
    ];

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telephony => "telephony",
            Self::Calendar => "calendar",
            Self::SmsDelivery => "sms-delivery",
            Self::ReviewPlatform => "review-platform",
        }
    }

    /// Provider-specific event label recorded on each attempt
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Telephony => "call-status-update",
            Self::Calendar => "calendar-event-sync",
            Self::SmsDelivery => "sms-delivery-status",
            Self::ReviewPlatform => "review-received",
        }
    }
}

impl fmt::Display for WebhookSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookSource {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "telephony" | "calls" => Ok(Self::Telephony),
            "calendar" => Ok(Self::Calendar),
            "sms-delivery" | "sms" => Ok(Self::SmsDelivery),
            "review-platform" | "reviews" => Ok(Self::ReviewPlatform),
            _ => Err(ParseError::InvalidFormat {
                expected: "telephony, calendar, sms-delivery, or review-platform".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp with microsecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing UTC datetime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Add seconds to timestamp
    pub fn add_seconds(&self, seconds: i64) -> Self {
        Self(self.0 + chrono::Duration::seconds(seconds))
    }

}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure taxonomy recorded on failed attempts and used for response mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Bad or missing signature; rejected before anything else runs
    Authentication,
    /// Structurally invalid payload
    Validation,
    /// Valid payload with no matching tenant or target entity
    Resolution,
    /// Duplicate external identifier; benign for most callers
    Conflict,
    /// Store or collaborator failure; eligible for manual retry
    Downstream,
}

impl FailureKind {
    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Validation => "validation",
            Self::Resolution => "resolution",
            Self::Conflict => "conflict",
            Self::Downstream => "downstream",
        }
    }

    /// Whether a failed attempt of this kind may be replayed by an operator
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Authentication)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },
}

/// Error type for string parsing failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Provider signature verification schemes
pub mod signature;

/// Per-provider payload decoding and schema validation
pub mod schema;

/// Business entity records and the store collaborator traits
pub mod store;

/// Tenant resolution from webhook identifiers
pub mod resolver;

/// Idempotent application of validated events to business entities
pub mod reconciler;

/// Webhook attempt audit log
pub mod audit;

/// Internal notification side effects
pub mod notify;

/// The end-to-end webhook processing pipeline
pub mod pipeline;

// Re-export key types for convenience
pub use audit::{
    AttemptPage, AttemptQuery, AttemptStatus, AttemptStore, AuditError, AuditLog,
    InMemoryAttemptStore, NewAttempt, Pagination, WebhookAttempt,
};
pub use notify::{
    InMemoryNotificationSink, LoggingNotificationSink, Notification, NotificationEmitter,
    NotificationKind, NotificationSink,
};
pub use pipeline::{
    PipelineConfig, PipelineError, PipelineOutcome, ProviderCredentials, WebhookPipeline,
    WebhookRequest,
};
pub use reconciler::{ReconcileAction, ReconcileError, ReconcileOutcome, Reconciler};
pub use resolver::{
    BusinessResolver, InMemoryTenantDirectory, ResolutionHints, ResolverError, TenantDirectory,
    TenantRecord,
    TenantResolution,
};
pub use schema::{SchemaError, TypedEnvelope};
pub use signature::{SignatureAlgorithm, SignatureScheme, VerificationContext, WebhookSecret};
pub use store::{BusinessStores, EntityKind, EntityStore, ExternalLink, StoreError};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
