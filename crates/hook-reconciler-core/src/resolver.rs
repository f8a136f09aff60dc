//! # Business Resolution
//!
//! Maps a validated envelope to the tenant that owns it. Resolution is its
//! own stage so the reconciler only ever receives a definite tenant:
//! [`TenantResolution::NotFound`] is an ordinary outcome, and
//! [`ResolverError`] is reserved for the directory itself failing.
//!
//! Strategies, first match wins:
//!
//! 1. an explicit tenant token supplied by the provider channel, honoured only
//!    if the tenant exists
//! 2. phone number lookup (telephony `To` then `From`, SMS `from` then `to`)
//! 3. identifiers carried in the payload (review `businessId`, calendar
//!    `calendarId` then organizer email)

use crate::schema::TypedEnvelope;
use crate::TenantId;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

// ============================================================================
// Types
// ============================================================================

/// Out-of-band resolution input taken from request headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionHints {
    /// Tenant token echoed back by the provider (calendar channel token)
    pub tenant_token: Option<String>,
}

/// Outcome of resolving an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantResolution {
    Tenant(TenantId),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolverError {
    #[error("Tenant directory unavailable: {message}")]
    DirectoryUnavailable { message: String },

    #[error("'{key}' is mapped to both '{first}' and '{second}'")]
    DuplicateMapping {
        key: String,
        first: TenantId,
        second: TenantId,
    },
}

impl ResolverError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DirectoryUnavailable { .. })
    }
}

/// Lookup tables that identify a tenant from provider data
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> Result<bool, ResolverError>;

    /// `phone` is already normalised by [`normalize_phone`]
    async fn find_by_phone(&self, phone: &str) -> Result<Option<TenantId>, ResolverError>;

    async fn find_by_calendar_id(
        &self,
        calendar_id: &str,
    ) -> Result<Option<TenantId>, ResolverError>;

    /// Case-insensitive
    async fn find_by_email(&self, email: &str) -> Result<Option<TenantId>, ResolverError>;
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves envelopes to tenants through a [`TenantDirectory`]
#[derive(Clone)]
pub struct BusinessResolver {
    directory: Arc<dyn TenantDirectory>,
}

impl BusinessResolver {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self { directory }
    }

    #[instrument(skip(self, envelope, hints), fields(source = %envelope.source()))]
    pub async fn resolve(
        &self,
        envelope: &TypedEnvelope,
        hints: &ResolutionHints,
    ) -> Result<TenantResolution, ResolverError> {
        if let Some(tenant) = self.from_token(hints).await? {
            debug!(tenant_id = %tenant, "Resolved tenant from token");
            return Ok(TenantResolution::Tenant(tenant));
        }

        let resolved = match envelope {
            TypedEnvelope::Telephony(event) => {
                self.from_phones([event.to.as_deref(), event.from.as_deref()])
                    .await?
            }
            TypedEnvelope::SmsDelivery(event) => {
                self.from_phones([event.from.as_deref(), event.to.as_deref()])
                    .await?
            }
            TypedEnvelope::Review(event) => self.existing(&event.business_id).await?,
            TypedEnvelope::Calendar(event) => {
                let by_calendar = match event.calendar_id.as_deref() {
                    Some(calendar_id) => self.directory.find_by_calendar_id(calendar_id).await?,
                    None => None,
                };
                match (by_calendar, event.organizer_email.as_deref()) {
                    (Some(tenant), _) => Some(tenant),
                    (None, Some(email)) => self.directory.find_by_email(email).await?,
                    (None, None) => None,
                }
            }
        };

        Ok(match resolved {
            Some(tenant) => {
                debug!(tenant_id = %tenant, "Resolved tenant from payload");
                TenantResolution::Tenant(tenant)
            }
            None => TenantResolution::NotFound,
        })
    }

    async fn from_token(&self, hints: &ResolutionHints) -> Result<Option<TenantId>, ResolverError> {
        match hints.tenant_token.as_deref() {
            Some(token) => self.existing(token).await,
            None => Ok(None),
        }
    }

    async fn from_phones(
        &self,
        candidates: [Option<&str>; 2],
    ) -> Result<Option<TenantId>, ResolverError> {
        for candidate in candidates.into_iter().flatten() {
            let Some(phone) = normalize_phone(candidate) else {
                continue;
            };
            if let Some(tenant) = self.directory.find_by_phone(&phone).await? {
                return Ok(Some(tenant));
            }
        }
        Ok(None)
    }

    /// The tenant named by `raw`, if it is a valid id of a known tenant.
    async fn existing(&self, raw: &str) -> Result<Option<TenantId>, ResolverError> {
        let Ok(tenant) = TenantId::new(raw.trim()) else {
            return Ok(None);
        };
        if self.directory.tenant_exists(&tenant).await? {
            Ok(Some(tenant))
        } else {
            Ok(None)
        }
    }
}

/// Normalise a phone number to `+` followed by digits.
///
/// Ten-digit numbers are treated as North American. Values with fewer than
/// seven digits (`anonymous`, SIP client names) yield `None`.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 7 {
        return None;
    }

    let international = raw.trim_start().starts_with('+');
    Some(match (international, digits.len()) {
        (false, 10) => format!("+1{digits}"),
        _ => format!("+{digits}"),
    })
}

// ============================================================================
// In-memory directory
// ============================================================================

/// One tenant's lookup identifiers, as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    #[serde(default)]
    pub phone_numbers: Vec<String>,
    #[serde(default)]
    pub calendar_ids: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

/// Read-only directory built once from configuration
#[derive(Debug, Clone, Default)]
pub struct InMemoryTenantDirectory {
    tenants: HashSet<TenantId>,
    phones: HashMap<String, TenantId>,
    calendars: HashMap<String, TenantId>,
    emails: HashMap<String, TenantId>,
}

impl InMemoryTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the lookup tables, rejecting identifiers claimed by two tenants.
    pub fn from_records(records: &[TenantRecord]) -> Result<Self, ResolverError> {
        let mut directory = Self::new();
        for record in records {
            directory.tenants.insert(record.id.clone());
            for phone in &record.phone_numbers {
                let key = normalize_phone(phone).unwrap_or_else(|| phone.clone());
                insert_unique(&mut directory.phones, key, &record.id)?;
            }
            for calendar_id in &record.calendar_ids {
                insert_unique(&mut directory.calendars, calendar_id.clone(), &record.id)?;
            }
            for email in &record.emails {
                insert_unique(&mut directory.emails, email.to_lowercase(), &record.id)?;
            }
        }
        Ok(directory)
    }
}

fn insert_unique(
    table: &mut HashMap<String, TenantId>,
    key: String,
    tenant: &TenantId,
) -> Result<(), ResolverError> {
    match table.get(&key) {
        Some(existing) if existing != tenant => Err(ResolverError::DuplicateMapping {
            key,
            first: existing.clone(),
            second: tenant.clone(),
        }),
        _ => {
            table.insert(key, tenant.clone());
            Ok(())
        }
    }
}

#[async_trait]
impl TenantDirectory for InMemoryTenantDirectory {
    async fn tenant_exists(&self, tenant_id: &TenantId) -> Result<bool, ResolverError> {
        Ok(self.tenants.contains(tenant_id))
    }

    async fn find_by_phone(&self, phone: &str) -> Result<Option<TenantId>, ResolverError> {
        Ok(self.phones.get(phone).cloned())
    }

    async fn find_by_calendar_id(
        &self,
        calendar_id: &str,
    ) -> Result<Option<TenantId>, ResolverError> {
        Ok(self.calendars.get(calendar_id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<TenantId>, ResolverError> {
        Ok(self.emails.get(&email.to_lowercase()).cloned())
    }
}

#[cfg(test)]
#[path = "resolver_tests.rs"]
mod tests;
