//! Response types and query parameters for the API.

use hook_reconciler_core::{
    AttemptId, AttemptPage, EntityKind, FailureKind, PipelineError, ReconcileAction,
    ReconcileOutcome, Timestamp, WebhookAttempt, WebhookSource,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Webhook responses
// ============================================================================

/// Body of every `200` webhook response
///
/// Besides the fixed fields, each response carries `<entity>Updated` and,
/// for first sightings, `<entity>Created` (`callUpdated`, `reviewCreated`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub success: bool,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,

    /// Machine-readable reason for business-level failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(flatten)]
    pub entity_flags: BTreeMap<String, bool>,
}

impl WebhookResponse {
    pub fn reconciled(attempt_id: Option<AttemptId>, outcome: &ReconcileOutcome) -> Self {
        let entity = outcome.entity.as_str();
        let mut entity_flags = BTreeMap::new();
        entity_flags.insert(
            format!("{entity}Updated"),
            outcome.action != ReconcileAction::Unchanged,
        );
        if outcome.action == ReconcileAction::Created {
            entity_flags.insert(format!("{entity}Created"), true);
        }

        let message = match outcome.action {
            ReconcileAction::Created => format!("{entity} created"),
            ReconcileAction::Updated => format!("{entity} updated"),
            ReconcileAction::Unchanged => format!("{entity} already up to date"),
        };

        Self {
            success: true,
            message,
            attempt_id,
            reason: None,
            entity_flags,
        }
    }

    /// A failure past authentication and validation, still answered with `200`.
    pub fn business_failure(
        source: WebhookSource,
        attempt_id: Option<AttemptId>,
        error: &PipelineError,
    ) -> Self {
        let entity = EntityKind::for_source(source).as_str();
        let mut entity_flags = BTreeMap::new();
        entity_flags.insert(format!("{entity}Updated"), false);

        // Store details stay in the logs and the audit record
        let message = if error.failure_kind() == FailureKind::Downstream {
            "Processing failed; the attempt was recorded for retry".to_string()
        } else {
            error.to_string()
        };

        Self {
            success: false,
            message,
            attempt_id,
            reason: Some(error.reason_code().to_string()),
            entity_flags,
        }
    }
}

// ============================================================================
// Operational responses
// ============================================================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: Timestamp,
    pub version: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub timestamp: Timestamp,
    /// Providers with a signing secret configured
    pub providers: Vec<WebhookSource>,
}

// ============================================================================
// Admin responses
// ============================================================================

/// Attempt list response
#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptListResponse {
    pub attempts: Vec<WebhookAttempt>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
    pub has_more: bool,
}

impl From<AttemptPage> for AttemptListResponse {
    fn from(page: AttemptPage) -> Self {
        let has_more = page.has_more();
        Self {
            attempts: page.attempts,
            total: page.total,
            page: page.page,
            per_page: page.per_page,
            has_more,
        }
    }
}

/// Attempt detail response
#[derive(Debug, Serialize, Deserialize)]
pub struct AttemptDetailResponse {
    pub attempt: WebhookAttempt,
}

/// Manual retry response
#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub success: bool,
    pub message: String,
    pub replay_of: AttemptId,
    /// The attempt recording the replay, absent if the audit store refused it
    pub attempt_id: Option<AttemptId>,
    pub failure_kind: Option<String>,
}

// ============================================================================
// Query Parameter Types
// ============================================================================

/// Parameters for attempt listing
#[derive(Debug, Default, Deserialize)]
pub struct AttemptListParams {
    pub source: Option<String>,
    pub status: Option<String>,
    pub tenant: Option<String>,
    /// RFC3339, inclusive
    pub from: Option<String>,
    /// RFC3339, exclusive
    pub to: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}
