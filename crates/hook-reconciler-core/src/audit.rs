//! # Webhook Attempt Audit Log
//!
//! Every inbound delivery produces exactly one [`WebhookAttempt`]. The record
//! is opened before any other side effect and closed exactly once. Only the
//! processing fields change after insertion, and status moves forward only:
//!
//! ```text
//! pending -> processing -> completed
//!    |            |
//!    +------------+------> failed
//! ```
//!
//! Storage sits behind [`AttemptStore`]; [`InMemoryAttemptStore`] serves
//! development and tests.

use crate::{AttemptId, FailureKind, TenantId, Timestamp, WebhookSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, instrument};

/// Largest page the query API will return
pub const MAX_PAGE_SIZE: u32 = 200;

// ============================================================================
// Core Types
// ============================================================================

/// Processing state of an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: AttemptStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Failed)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = crate::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(crate::ParseError::InvalidFormat {
                expected: "pending, processing, completed, or failed".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// One inbound delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookAttempt {
    pub id: AttemptId,
    pub source: WebhookSource,
    pub event_type: String,

    /// Decoded payload kept verbatim for replay; `Null` for authentication rejections
    pub raw_payload: serde_json::Value,

    /// Signature header as received. Never used to re-verify.
    pub signature: Option<String>,

    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub status: AttemptStatus,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retries: u32,
    pub replay_of: Option<AttemptId>,
    pub tenant_id: Option<TenantId>,
    pub processed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

/// Everything known about a delivery at the moment it arrives
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttempt {
    pub source: WebhookSource,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub signature: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub replay_of: Option<AttemptId>,
}

impl NewAttempt {
    pub fn new(source: WebhookSource, payload: serde_json::Value) -> Self {
        Self {
            source,
            event_type: source.event_type().to_string(),
            payload,
            signature: None,
            source_ip: None,
            user_agent: None,
            replay_of: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
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

    pub fn replaying(mut self, original: AttemptId) -> Self {
        self.replay_of = Some(original);
        self
    }
}

/// Filter for listing attempts; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptQuery {
    pub source: Option<WebhookSource>,
    pub status: Option<AttemptStatus>,
    pub tenant_id: Option<TenantId>,
    /// Inclusive lower bound on `created_at`
    pub from: Option<Timestamp>,
    /// Exclusive upper bound on `created_at`
    pub to: Option<Timestamp>,
}

impl AttemptQuery {
    pub fn matches(&self, attempt: &WebhookAttempt) -> bool {
        self.source.map_or(true, |s| s == attempt.source)
            && self.status.map_or(true, |s| s == attempt.status)
            && self
                .tenant_id
                .as_ref()
                .map_or(true, |t| attempt.tenant_id.as_ref() == Some(t))
            && self.from.map_or(true, |from| attempt.created_at >= from)
            && self.to.map_or(true, |to| attempt.created_at < to)
    }
}

/// One-based page selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub per_page: u32,
}

impl Pagination {
    /// Clamp to page >= 1 and 1 <= per_page <= [`MAX_PAGE_SIZE`]
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.per_page as usize
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(1, 50)
    }
}

/// One page of query results, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptPage {
    pub attempts: Vec<WebhookAttempt>,
    pub total: usize,
    pub page: u32,
    pub per_page: u32,
}

impl AttemptPage {
    pub fn has_more(&self) -> bool {
        (self.page as usize) * (self.per_page as usize) < self.total
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("Attempt not found: {attempt_id}")]
    NotFound { attempt_id: AttemptId },

    #[error("Attempt {attempt_id} cannot move from {from} to {to}")]
    InvalidTransition {
        attempt_id: AttemptId,
        from: AttemptStatus,
        to: AttemptStatus,
    },

    #[error("Attempt already exists: {attempt_id}")]
    AlreadyExists { attempt_id: AttemptId },

    #[error("Attempt {attempt_id} retry count moved from {expected} to {actual}")]
    RetryConflict {
        attempt_id: AttemptId,
        expected: u32,
        actual: u32,
    },

    #[error("Storage error: {message}")]
    StorageError { message: String },
}

impl AuditError {
    /// Check if error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::StorageError { .. })
    }
}

// ============================================================================
// Storage trait
// ============================================================================

/// Persistence for attempt records
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert(&self, attempt: WebhookAttempt) -> Result<(), AuditError>;

    async fn get(&self, attempt_id: &AttemptId) -> Result<Option<WebhookAttempt>, AuditError>;

    /// Replace a stored record
    async fn update(&self, attempt: WebhookAttempt) -> Result<(), AuditError>;

    /// Bump `retries` by one if it still equals `expected`; returns the new count.
    ///
    /// The compare and the write must happen as one step.
    async fn increment_retries(
        &self,
        attempt_id: &AttemptId,
        expected: u32,
    ) -> Result<u32, AuditError>;

    async fn query(
        &self,
        query: &AttemptQuery,
        pagination: Pagination,
    ) -> Result<AttemptPage, AuditError>;
}

// ============================================================================
// Audit log
// ============================================================================

/// State-machine front end over an [`AttemptStore`]
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn AttemptStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AttemptStore>) -> Self {
        Self { store }
    }

    /// Record a newly received delivery in `pending` state
    #[instrument(skip(self, attempt), fields(source = %attempt.source))]
    pub async fn open(&self, attempt: NewAttempt) -> Result<AttemptId, AuditError> {
        let record = WebhookAttempt {
            id: AttemptId::new(),
            source: attempt.source,
            event_type: attempt.event_type,
            raw_payload: attempt.payload,
            signature: attempt.signature,
            source_ip: attempt.source_ip,
            user_agent: attempt.user_agent,
            status: AttemptStatus::Pending,
            error_message: None,
            failure_kind: None,
            retries: 0,
            replay_of: attempt.replay_of,
            tenant_id: None,
            processed_at: None,
            created_at: Timestamp::now(),
        };
        let id = record.id;
        self.store.insert(record).await?;
        debug!(attempt_id = %id, "Opened webhook attempt");
        Ok(id)
    }

    pub async fn begin_processing(&self, attempt_id: &AttemptId) -> Result<(), AuditError> {
        self.modify(attempt_id, |attempt| {
            advance(attempt, AttemptStatus::Processing)
        })
        .await
    }

    pub async fn assign_tenant(
        &self,
        attempt_id: &AttemptId,
        tenant_id: &TenantId,
    ) -> Result<(), AuditError> {
        self.modify(attempt_id, |attempt| {
            attempt.tenant_id = Some(tenant_id.clone());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, attempt_id: &AttemptId) -> Result<(), AuditError> {
        self.modify(attempt_id, |attempt| {
            advance(attempt, AttemptStatus::Completed)?;
            attempt.processed_at = Some(Timestamp::now());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, reason))]
    pub async fn fail(
        &self,
        attempt_id: &AttemptId,
        failure_kind: FailureKind,
        reason: &str,
    ) -> Result<(), AuditError> {
        self.modify(attempt_id, |attempt| {
            advance(attempt, AttemptStatus::Failed)?;
            attempt.failure_kind = Some(failure_kind);
            attempt.error_message = Some(reason.to_string());
            attempt.processed_at = Some(Timestamp::now());
            Ok(())
        })
        .await
    }

    /// Count one more reprocessing of a stored attempt; returns the new count
    ///
    /// `seen_retries` is the count the caller read. A caller that lost a race
    /// with another retry gets [`AuditError::RetryConflict`].
    #[instrument(skip(self))]
    pub async fn record_retry(
        &self,
        attempt_id: &AttemptId,
        seen_retries: u32,
    ) -> Result<u32, AuditError> {
        self.store.increment_retries(attempt_id, seen_retries).await
    }

    pub async fn get(&self, attempt_id: &AttemptId) -> Result<WebhookAttempt, AuditError> {
        self.store
            .get(attempt_id)
            .await?
            .ok_or(AuditError::NotFound {
                attempt_id: *attempt_id,
            })
    }

    pub async fn query(
        &self,
        query: &AttemptQuery,
        pagination: Pagination,
    ) -> Result<AttemptPage, AuditError> {
        self.store.query(query, pagination).await
    }

    async fn modify<F>(&self, attempt_id: &AttemptId, change: F) -> Result<(), AuditError>
    where
        F: FnOnce(&mut WebhookAttempt) -> Result<(), AuditError>,
    {
        let mut attempt = self.get(attempt_id).await?;
        change(&mut attempt)?;
        self.store.update(attempt).await
    }
}

fn advance(attempt: &mut WebhookAttempt, next: AttemptStatus) -> Result<(), AuditError> {
    if !attempt.status.can_transition_to(next) {
        return Err(AuditError::InvalidTransition {
            attempt_id: attempt.id,
            from: attempt.status,
            to: next,
        });
    }
    attempt.status = next;
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Thread-safe in-memory attempt store
///
/// Keyed by ULID, so iteration order is arrival order.
#[derive(Clone, Default)]
pub struct InMemoryAttemptStore {
    attempts: Arc<RwLock<BTreeMap<AttemptId, WebhookAttempt>>>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> AuditError {
        AuditError::StorageError {
            message: "attempt store lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn insert(&self, attempt: WebhookAttempt) -> Result<(), AuditError> {
        let mut attempts = self.attempts.write().map_err(|_| Self::poisoned())?;
        if attempts.contains_key(&attempt.id) {
            return Err(AuditError::AlreadyExists {
                attempt_id: attempt.id,
            });
        }
        attempts.insert(attempt.id, attempt);
        Ok(())
    }

    async fn get(&self, attempt_id: &AttemptId) -> Result<Option<WebhookAttempt>, AuditError> {
        let attempts = self.attempts.read().map_err(|_| Self::poisoned())?;
        Ok(attempts.get(attempt_id).cloned())
    }

    async fn update(&self, attempt: WebhookAttempt) -> Result<(), AuditError> {
        let mut attempts = self.attempts.write().map_err(|_| Self::poisoned())?;
        match attempts.get_mut(&attempt.id) {
            Some(stored) => {
                *stored = attempt;
                Ok(())
            }
            None => Err(AuditError::NotFound {
                attempt_id: attempt.id,
            }),
        }
    }

    async fn increment_retries(
        &self,
        attempt_id: &AttemptId,
        expected: u32,
    ) -> Result<u32, AuditError> {
        let mut attempts = self.attempts.write().map_err(|_| Self::poisoned())?;
        let stored = attempts.get_mut(attempt_id).ok_or(AuditError::NotFound {
            attempt_id: *attempt_id,
        })?;
        if stored.retries != expected {
            return Err(AuditError::RetryConflict {
                attempt_id: *attempt_id,
                expected,
                actual: stored.retries,
            });
        }
        stored.retries += 1;
        Ok(stored.retries)
    }

    async fn query(
        &self,
        query: &AttemptQuery,
        pagination: Pagination,
    ) -> Result<AttemptPage, AuditError> {
        let attempts = self.attempts.read().map_err(|_| Self::poisoned())?;
        let matching: Vec<&WebhookAttempt> = attempts
            .values()
            .rev()
            .filter(|attempt| query.matches(attempt))
            .collect();

        Ok(AttemptPage {
            total: matching.len(),
            attempts: matching
                .into_iter()
                .skip(pagination.offset())
                .take(pagination.per_page as usize)
                .cloned()
                .collect(),
            page: pagination.page,
            per_page: pagination.per_page,
        })
    }
}

#[cfg(test)]
#[path = "audit_tests.rs"]
mod tests;
