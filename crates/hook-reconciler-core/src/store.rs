//! # Business Entity Store
//!
//! Records the reconciler writes and the collaborator trait it writes them
//! through. Every entity carries the [`ExternalLink`] it was created from;
//! the store guarantees at most one entity per link and reports a second
//! insert as [`StoreError::UniqueViolation`]. Updates are conditional on the
//! version the caller read, so concurrent writers surface as
//! [`StoreError::VersionConflict`] rather than lost updates.

use crate::schema::ReviewPlatform;
use crate::{EntityId, TenantId, Timestamp, WebhookSource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

// ============================================================================
// Link and metadata
// ============================================================================

/// Idempotency key tying an internal entity to a provider identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalLink {
    pub source: WebhookSource,
    pub external_id: String,
    pub tenant_id: TenantId,
}

impl ExternalLink {
    pub fn new(source: WebhookSource, external_id: impl Into<String>, tenant_id: TenantId) -> Self {
        Self {
            source,
            external_id: external_id.into(),
            tenant_id,
        }
    }
}

impl fmt::Display for ExternalLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.source, self.external_id)
    }
}

/// Fields shared by every stored entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    pub id: EntityId,
    pub link: ExternalLink,
    /// Incremented by the store on every successful update
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl EntityMeta {
    pub fn new(link: ExternalLink) -> Self {
        let now = Timestamp::now();
        Self {
            id: EntityId::new(),
            link,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Kind of business entity a webhook touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Call,
    Appointment,
    Message,
    Review,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Appointment => "appointment",
            Self::Message => "message",
            Self::Review => "review",
        }
    }

    /// Entity a source reconciles into
    pub fn for_source(source: WebhookSource) -> Self {
        match source {
            WebhookSource::Telephony => Self::Call,
            WebhookSource::Calendar => Self::Appointment,
            WebhookSource::SmsDelivery => Self::Message,
            WebhookSource::ReviewPlatform => Self::Review,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access to the common metadata of an entity type
pub trait StoredEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn meta(&self) -> &EntityMeta;
    fn meta_mut(&mut self) -> &mut EntityMeta;
}

macro_rules! stored_entity {
    ($entity:ty, $kind:expr) => {
        impl StoredEntity for $entity {
            const KIND: EntityKind = $kind;

            fn meta(&self) -> &EntityMeta {
                &self.meta
            }

            fn meta_mut(&mut self) -> &mut EntityMeta {
                &mut self.meta
            }
        }
    };
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRecordStatus {
    Ringing,
    Completed,
    Missed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub meta: EntityMeta,
    pub status: CallRecordStatus,
    /// Last call status reported by the provider, e.g. `answered`
    pub provider_status: String,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub duration_seconds: Option<u32>,
    pub recording_url: Option<String>,
    pub transcript: Option<String>,
    pub direction: Option<String>,
}

stored_entity!(CallRecord, EntityKind::Call);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Tentative,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub meta: EntityMeta,
    pub title: String,
    pub starts_at: Timestamp,
    pub ends_at: Timestamp,
    pub duration_minutes: i64,
    pub status: AppointmentStatus,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub location: Option<String>,
    pub notes: Option<String>,
    pub cancelled_at: Option<Timestamp>,
}

stored_entity!(Appointment, EntityKind::Appointment);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
    Undelivered,
}

/// Outbound message in a customer conversation
///
/// Created by the sending path; delivery receipts only ever update it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub meta: EntityMeta,
    pub status: MessageStatus,
    pub to_number: Option<String>,
    pub body: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Provider timestamp of the last receipt applied
    pub status_updated_at: Option<Timestamp>,
}

impl ConversationMessage {
    /// Record of a message handed to the SMS provider
    pub fn outbound(
        link: ExternalLink,
        to_number: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            meta: EntityMeta::new(link),
            status: MessageStatus::Queued,
            to_number: Some(to_number.into()),
            body: body.into(),
            error_code: None,
            error_message: None,
            status_updated_at: None,
        }
    }
}

stored_entity!(ConversationMessage, EntityKind::Message);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub meta: EntityMeta,
    pub platform: ReviewPlatform,
    pub rating: u8,
    pub reviewer_name: Option<String>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub reviewed_at: Option<Timestamp>,
}

stored_entity!(Review, EntityKind::Review);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("An entity already exists for link {link}")]
    UniqueViolation { link: String },

    #[error("Entity {entity_id} changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        entity_id: EntityId,
        expected: u64,
        actual: u64,
    },

    #[error("Entity not found: {entity_id}")]
    NotFound { entity_id: EntityId },

    #[error("Store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Unavailable { .. })
    }

    fn poisoned() -> Self {
        Self::Unavailable {
            message: "store lock poisoned".to_string(),
        }
    }
}

// ============================================================================
// Store trait
// ============================================================================

/// Persistence for one entity type
#[async_trait]
pub trait EntityStore<E: StoredEntity>: Send + Sync {
    /// Find the entity created from `link`
    async fn find_by_link(&self, link: &ExternalLink) -> Result<Option<E>, StoreError>;

    /// Insert a new entity, failing with `UniqueViolation` if its link is taken
    async fn insert(&self, entity: E) -> Result<E, StoreError>;

    /// Replace an entity if its stored version is still `expected_version`.
    ///
    /// Returns the stored entity with its version incremented.
    async fn update(&self, entity: E, expected_version: u64) -> Result<E, StoreError>;
}

/// The four entity stores the reconciler writes to
#[derive(Clone)]
pub struct BusinessStores {
    pub calls: Arc<dyn EntityStore<CallRecord>>,
    pub appointments: Arc<dyn EntityStore<Appointment>>,
    pub messages: Arc<dyn EntityStore<ConversationMessage>>,
    pub reviews: Arc<dyn EntityStore<Review>>,
}

impl BusinessStores {
    /// Fresh in-memory stores for every entity type
    pub fn in_memory() -> Self {
        Self {
            calls: Arc::new(InMemoryEntityStore::<CallRecord>::new()),
            appointments: Arc::new(InMemoryEntityStore::<Appointment>::new()),
            messages: Arc::new(InMemoryEntityStore::<ConversationMessage>::new()),
            reviews: Arc::new(InMemoryEntityStore::<Review>::new()),
        }
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct Table<E> {
    rows: HashMap<EntityId, E>,
    links: HashMap<ExternalLink, EntityId>,
}

/// Thread-safe in-memory entity store for development and tests
///
/// The link index and the rows live under one lock so the uniqueness check
/// and the insert are a single critical section.
#[derive(Clone)]
pub struct InMemoryEntityStore<E> {
    table: Arc<RwLock<Table<E>>>,
}

impl<E: StoredEntity> InMemoryEntityStore<E> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(Table {
                rows: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    /// Number of stored entities
    pub fn len(&self) -> usize {
        self.table.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: StoredEntity> Default for InMemoryEntityStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E: StoredEntity> EntityStore<E> for InMemoryEntityStore<E> {
    async fn find_by_link(&self, link: &ExternalLink) -> Result<Option<E>, StoreError> {
        let table = self.table.read().map_err(|_| StoreError::poisoned())?;
        Ok(table
            .links
            .get(link)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn insert(&self, entity: E) -> Result<E, StoreError> {
        let mut table = self.table.write().map_err(|_| StoreError::poisoned())?;
        let link = entity.meta().link.clone();
        if table.links.contains_key(&link) {
            return Err(StoreError::UniqueViolation {
                link: link.to_string(),
            });
        }

        let id = entity.meta().id;
        table.links.insert(link, id);
        table.rows.insert(id, entity.clone());
        Ok(entity)
    }

    async fn update(&self, mut entity: E, expected_version: u64) -> Result<E, StoreError> {
        let mut table = self.table.write().map_err(|_| StoreError::poisoned())?;
        let id = entity.meta().id;
        let actual = table
            .rows
            .get(&id)
            .map(|stored| stored.meta().version)
            .ok_or(StoreError::NotFound { entity_id: id })?;

        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                entity_id: id,
                expected: expected_version,
                actual,
            });
        }

        let meta = entity.meta_mut();
        meta.version = actual + 1;
        meta.updated_at = Timestamp::now();
        table.rows.insert(id, entity.clone());
        Ok(entity)
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
