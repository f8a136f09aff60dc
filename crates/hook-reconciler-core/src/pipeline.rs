//! # Webhook Pipeline
//!
//! The staged control flow for one delivery:
//!
//! ```text
//! authenticate -> decode -> validate -> open attempt -> resolve -> reconcile
//!      |             |          |                         |           |
//!      +-------------+----------+---- fail attempt <------+-----------+
//!                                          |
//!                              complete attempt -> notify
//! ```
//!
//! Authentication and validation are CPU-only and finish before any store
//! is touched. Every call to [`WebhookPipeline::process`] or
//! [`WebhookPipeline::replay`] opens exactly one attempt and closes it
//! exactly once. Audit write failures are logged and never change the
//! processing result. Notification failures are swallowed.

use crate::audit::{AttemptStatus, AuditError, AuditLog, NewAttempt};
use crate::notify::NotificationEmitter;
use crate::reconciler::{ReconcileError, ReconcileOutcome, Reconciler};
use crate::resolver::{BusinessResolver, ResolutionHints, ResolverError, TenantResolution};
use crate::schema::{self, SchemaError, TypedEnvelope};
use crate::signature::{
    self, SignatureAlgorithm, SignatureScheme, VerificationContext, WebhookSecret,
};
use crate::{AttemptId, FailureKind, TenantId, Timestamp, WebhookSource};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Default acceptance window for signed timestamps
pub const DEFAULT_TIMESTAMP_TOLERANCE: Duration = Duration::from_secs(300);

// ============================================================================
// Configuration
// ============================================================================

/// Signing material for one provider integration
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub secret: WebhookSecret,
    /// Only consulted by the generic body scheme
    pub algorithm: SignatureAlgorithm,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub providers: HashMap<WebhookSource, ProviderCredentials>,
    pub timestamp_tolerance: Duration,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            timestamp_tolerance: DEFAULT_TIMESTAMP_TOLERANCE,
        }
    }

    pub fn with_provider(
        mut self,
        source: WebhookSource,
        secret: WebhookSecret,
        algorithm: SignatureAlgorithm,
    ) -> Self {
        self.providers
            .insert(source, ProviderCredentials { secret, algorithm });
        self
    }

    pub fn with_timestamp_tolerance(mut self, tolerance: Duration) -> Self {
        self.timestamp_tolerance = tolerance;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Request and outcome
// ============================================================================

/// One inbound delivery as the transport layer saw it
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub source: WebhookSource,
    pub raw_body: Bytes,
    pub signature: Option<String>,
    pub context: VerificationContext,
    pub hints: ResolutionHints,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl WebhookRequest {
    pub fn new(source: WebhookSource, raw_body: impl Into<Bytes>) -> Self {
        Self {
            source,
            raw_body: raw_body.into(),
            signature: None,
            context: VerificationContext::default(),
            hints: ResolutionHints::default(),
            source_ip: None,
            user_agent: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_context(mut self, context: VerificationContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_hints(mut self, hints: ResolutionHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_provenance(
        mut self,
        source_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        self.source_ip = source_ip;
        self.user_agent = user_agent;
        self
    }
}

/// Result of running one delivery through the pipeline
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub source: WebhookSource,
    /// `None` only if the audit store refused the record
    pub attempt_id: Option<AttemptId>,
    pub result: Result<ReconcileOutcome, PipelineError>,
    /// Whether a notification was attempted and whether it was delivered
    pub notification_delivered: Option<bool>,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.result.as_ref().err().map(PipelineError::failure_kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] SchemaError),

    #[error("No tenant matches this {webhook_source} webhook")]
    TenantNotFound { webhook_source: WebhookSource },

    #[error("Tenant resolution failed: {0}")]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("Attempt not found: {attempt_id}")]
    AttemptNotFound { attempt_id: AttemptId },

    #[error("Attempt {attempt_id} cannot be replayed: {reason}")]
    NotReplayable { attempt_id: AttemptId, reason: String },

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),
}

impl PipelineError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Authentication { .. } => FailureKind::Authentication,
            Self::Validation(_) | Self::NotReplayable { .. } => FailureKind::Validation,
            Self::TenantNotFound { .. } | Self::AttemptNotFound { .. } => FailureKind::Resolution,
            Self::Reconcile(e) => e.failure_kind(),
            Self::Resolver(_) | Self::Audit(_) => FailureKind::Downstream,
        }
    }

    /// Machine-readable reason included in responses
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "invalid_signature",
            Self::Validation(_) => "invalid_payload",
            Self::TenantNotFound { .. } => "tenant_not_found",
            Self::Resolver(_) => "resolver_unavailable",
            Self::Reconcile(e) => e.reason_code(),
            Self::AttemptNotFound { .. } => "attempt_not_found",
            Self::NotReplayable { .. } => "not_replayable",
            Self::Audit(_) => "audit_unavailable",
        }
    }

    /// Check if error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Resolver(e) => e.is_transient(),
            Self::Reconcile(e) => e.is_transient(),
            Self::Audit(e) => e.is_transient(),
            _ => false,
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Clone)]
pub struct WebhookPipeline {
    config: Arc<PipelineConfig>,
    resolver: BusinessResolver,
    reconciler: Reconciler,
    audit: AuditLog,
    notifier: NotificationEmitter,
}

impl WebhookPipeline {
    pub fn new(
        config: PipelineConfig,
        resolver: BusinessResolver,
        reconciler: Reconciler,
        audit: AuditLog,
        notifier: NotificationEmitter,
    ) -> Self {
        Self {
            config: Arc::new(config),
            resolver,
            reconciler,
            audit,
            notifier,
        }
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run a fresh delivery through every stage.
    #[instrument(skip_all, fields(source = %request.source))]
    pub async fn process(&self, request: WebhookRequest) -> PipelineOutcome {
        let source = request.source;

        if let Err(reason) = self.authenticate(&request) {
            warn!(reason = %reason, source_ip = ?request.source_ip, "Rejected webhook signature");
            // Unauthenticated content is never stored
            let attempt = NewAttempt::new(source, Value::Null)
                .with_provenance(request.source_ip, request.user_agent);
            let error = PipelineError::Authentication { reason };
            return self.reject(attempt, error).await;
        }

        let mut attempt = NewAttempt::new(source, Value::Null)
            .with_provenance(request.source_ip, request.user_agent);
        attempt.signature = request.signature;

        match schema::decode(source, &request.raw_body) {
            Ok(payload) => {
                attempt.payload = payload;
                self.run(attempt, &request.hints).await
            }
            Err(e) => {
                attempt.payload =
                    Value::String(String::from_utf8_lossy(&request.raw_body).into_owned());
                self.reject(attempt, PipelineError::Validation(e)).await
            }
        }
    }

    /// Re-run a failed attempt from its stored payload.
    ///
    /// The original attempt's retry counter is incremented and a new attempt,
    /// linked through `replay_of`, records the outcome. Signatures are not
    /// re-verified, so attempts rejected for authentication are refused.
    /// Of two replays that read the same retry count, only one proceeds.
    #[instrument(skip(self))]
    pub async fn replay(&self, attempt_id: &AttemptId) -> Result<PipelineOutcome, PipelineError> {
        let original = self.audit.get(attempt_id).await.map_err(|e| match e {
            AuditError::NotFound { attempt_id } => PipelineError::AttemptNotFound { attempt_id },
            other => PipelineError::Audit(other),
        })?;

        if original.status != AttemptStatus::Failed {
            return Err(PipelineError::NotReplayable {
                attempt_id: original.id,
                reason: format!(
                    "attempt is {}, only failed attempts can be replayed",
                    original.status
                ),
            });
        }
        if !original.failure_kind.is_some_and(|kind| kind.is_replayable()) {
            return Err(PipelineError::NotReplayable {
                attempt_id: original.id,
                reason: "authentication failures are never replayed".to_string(),
            });
        }

        let retries = self
            .audit
            .record_retry(&original.id, original.retries)
            .await
            .map_err(|e| match e {
                AuditError::RetryConflict { attempt_id, .. } => PipelineError::NotReplayable {
                    attempt_id,
                    reason: "another replay of this attempt is already in progress".to_string(),
                },
                other => PipelineError::Audit(other),
            })?;
        info!(retries, "Replaying webhook attempt");

        let mut attempt = NewAttempt::new(original.source, original.raw_payload)
            .with_provenance(original.source_ip, original.user_agent)
            .replaying(original.id);
        attempt.signature = original.signature;

        let hints = ResolutionHints {
            tenant_token: original.tenant_id.map(String::from),
        };
        Ok(self.run(attempt, &hints).await)
    }

    fn authenticate(&self, request: &WebhookRequest) -> Result<(), String> {
        let Some(credentials) = self.config.providers.get(&request.source) else {
            return Err(format!("no signing secret configured for {}", request.source));
        };
        let Some(header) = request.signature.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Err("missing signature header".to_string());
        };

        let scheme = SignatureScheme::for_source(request.source, credentials.algorithm);
        if !signature::verify(
            &scheme,
            &request.raw_body,
            header,
            credentials.secret.expose_secret(),
            &request.context,
        ) {
            return Err("signature mismatch".to_string());
        }

        if scheme == SignatureScheme::TimestampAndBody {
            let timestamp = request.context.timestamp.as_deref().unwrap_or_default();
            signature::check_timestamp_freshness(
                timestamp,
                self.config.timestamp_tolerance,
                Timestamp::now(),
            )
            .map_err(|e| e.to_string())?;
        }

        Ok(())
    }

    /// Validate, open, resolve, reconcile, close, notify.
    async fn run(&self, attempt: NewAttempt, hints: &ResolutionHints) -> PipelineOutcome {
        let source = attempt.source;
        let envelope = match schema::parse(source, &attempt.payload) {
            Ok(envelope) => envelope,
            Err(e) => return self.reject(attempt, PipelineError::Validation(e)).await,
        };

        // Nothing touches business data until the attempt is on record
        let attempt_id = match self.audit.open(attempt).await {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, "Failed to open webhook attempt, refusing to process");
                return PipelineOutcome {
                    source,
                    attempt_id: None,
                    result: Err(PipelineError::Audit(e)),
                    notification_delivered: None,
                };
            }
        };
        self.audited(
            "begin_processing",
            &attempt_id,
            self.audit.begin_processing(&attempt_id).await,
        );

        let result = self
            .resolve_and_reconcile(&attempt_id, &envelope, hints)
            .await;

        let mut notification_delivered = None;
        let result = match result {
            Ok((tenant, outcome)) => {
                self.audited(
                    "complete",
                    &attempt_id,
                    self.audit.complete(&attempt_id).await,
                );
                info!(
                    attempt_id = %attempt_id,
                    tenant_id = %tenant,
                    entity = %outcome.entity,
                    external_id = %outcome.external_id,
                    action = ?outcome.action,
                    "Webhook reconciled"
                );
                if let Some(notification) = &outcome.notification {
                    notification_delivered = Some(self.notifier.emit(&tenant, notification).await);
                }
                Ok(outcome)
            }
            Err(e) => {
                self.close_failed(Some(&attempt_id), &e).await;
                Err(e)
            }
        };

        PipelineOutcome {
            source,
            attempt_id: Some(attempt_id),
            result,
            notification_delivered,
        }
    }

    async fn resolve_and_reconcile(
        &self,
        attempt_id: &AttemptId,
        envelope: &TypedEnvelope,
        hints: &ResolutionHints,
    ) -> Result<(TenantId, ReconcileOutcome), PipelineError> {
        let tenant = match self.resolver.resolve(envelope, hints).await? {
            TenantResolution::Tenant(tenant) => tenant,
            TenantResolution::NotFound => {
                return Err(PipelineError::TenantNotFound {
                    webhook_source: envelope.source(),
                })
            }
        };

        self.audited(
            "assign_tenant",
            attempt_id,
            self.audit.assign_tenant(attempt_id, &tenant).await,
        );

        let outcome = self.reconciler.reconcile(&tenant, envelope).await?;
        Ok((tenant, outcome))
    }

    /// Record an attempt that failed before processing began.
    ///
    /// An audit outage here is only logged; the rejection itself stands.
    async fn reject(&self, attempt: NewAttempt, error: PipelineError) -> PipelineOutcome {
        let source = attempt.source;
        let attempt_id = match self.audit.open(attempt).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "Failed to record rejected webhook attempt");
                None
            }
        };
        self.close_failed(attempt_id.as_ref(), &error).await;
        PipelineOutcome {
            source,
            attempt_id,
            result: Err(error),
            notification_delivered: None,
        }
    }

    async fn close_failed(&self, attempt_id: Option<&AttemptId>, error: &PipelineError) {
        warn!(
            attempt_id = ?attempt_id,
            failure_kind = %error.failure_kind(),
            transient = error.is_transient(),
            error = %error,
            "Webhook processing failed"
        );
        if let Some(id) = attempt_id {
            let result = self
                .audit
                .fail(id, error.failure_kind(), &error.to_string())
                .await;
            self.audited("fail", id, result);
        }
    }

    fn audited(&self, operation: &str, attempt_id: &AttemptId, result: Result<(), AuditError>) {
        if let Err(e) = result {
            warn!(attempt_id = %attempt_id, operation, error = %e, "Audit log update failed");
        }
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
