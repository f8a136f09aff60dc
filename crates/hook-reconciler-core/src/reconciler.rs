//! # Idempotent Reconciliation
//!
//! Applies a validated envelope to the owning tenant's business entities
//! exactly once per external identifier. Idempotency comes from the store:
//!
//! 1. find the entity by its [`ExternalLink`]
//! 2. if absent, insert it; a [`StoreError::UniqueViolation`] means another
//!    delivery won the race, so re-read and update instead
//! 3. updates are conditional on the version read in step 1 and retried on
//!    [`StoreError::VersionConflict`]
//!
//! No in-process locks are involved, so several replicas can reconcile the
//! same event concurrently.

use crate::notify::{Notification, NotificationKind};
use crate::schema::{
    Attendee, CalendarEvent, CalendarEventStatus, CallStatus, ReviewEvent, SmsDeliveryEvent,
    SmsDeliveryStatus, TelephonyEvent, TypedEnvelope,
};
use crate::store::{
    Appointment, AppointmentStatus, BusinessStores, CallRecord, CallRecordStatus, EntityKind,
    EntityMeta, EntityStore, ExternalLink, MessageStatus, Review, StoreError, StoredEntity,
};
use crate::{EntityId, FailureKind, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Conditional update attempts before giving up on a contended entity
pub const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Appointments shorter than this are rounded up
pub const MIN_APPOINTMENT_MINUTES: i64 = 15;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    Created,
    Updated,
    /// The event was valid but changed nothing (repeat cancellation, stale receipt)
    Unchanged,
}

/// What reconciliation did to which entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub entity: EntityKind,
    pub entity_id: EntityId,
    pub external_id: String,
    pub action: ReconcileAction,
    /// Side effect for the pipeline to emit after the attempt is closed
    pub notification: Option<Notification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("No {entity} found for external id '{external_id}'")]
    EntityNotFound {
        entity: EntityKind,
        external_id: String,
    },

    #[error("A {entity} already exists for external id '{external_id}'")]
    AlreadyExists {
        entity: EntityKind,
        external_id: String,
    },

    #[error("Gave up on {entity} '{external_id}' after {attempts} conflicting updates")]
    ConcurrentModification {
        entity: EntityKind,
        external_id: String,
        attempts: usize,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::EntityNotFound { .. } => FailureKind::Resolution,
            Self::AlreadyExists { .. } => FailureKind::Conflict,
            Self::ConcurrentModification { .. } | Self::Store(_) => FailureKind::Downstream,
        }
    }

    /// Machine-readable reason included in webhook responses
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EntityNotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::Store(_) => "store_error",
        }
    }

    /// Check if error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConcurrentModification { .. } => true,
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Applies envelopes to the business stores
#[derive(Clone)]
pub struct Reconciler {
    stores: BusinessStores,
}

impl Reconciler {
    pub fn new(stores: BusinessStores) -> Self {
        Self { stores }
    }

    #[instrument(
        skip(self, envelope),
        fields(source = %envelope.source(), external_id = %envelope.external_id())
    )]
    pub async fn reconcile(
        &self,
        tenant_id: &TenantId,
        envelope: &TypedEnvelope,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let link = ExternalLink::new(envelope.source(), envelope.external_id(), tenant_id.clone());

        let outcome = match envelope {
            TypedEnvelope::Telephony(event) => self.reconcile_call(link, event).await?,
            TypedEnvelope::Calendar(event) if event.status == CalendarEventStatus::Cancelled => {
                self.cancel_appointment(link).await?
            }
            TypedEnvelope::Calendar(event) => self.sync_appointment(link, event).await?,
            TypedEnvelope::SmsDelivery(event) => self.apply_receipt(link, event).await?,
            TypedEnvelope::Review(event) => self.record_review(link, event).await?,
        };

        debug!(
            entity = %outcome.entity,
            entity_id = %outcome.entity_id,
            action = ?outcome.action,
            "Reconciled webhook"
        );
        Ok(outcome)
    }

    async fn reconcile_call(
        &self,
        link: ExternalLink,
        event: &TelephonyEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let status = call_record_status(event.call_status);
        let upserted = upsert(
            self.stores.calls.as_ref(),
            &link,
            || CallRecord {
                meta: EntityMeta::new(link.clone()),
                status,
                provider_status: String::new(),
                from_number: None,
                to_number: None,
                duration_seconds: None,
                recording_url: None,
                transcript: None,
                direction: None,
            },
            |record| {
                record.status = status;
                record.provider_status = event.call_status.as_str().to_string();
                overwrite(&mut record.from_number, &event.from);
                overwrite(&mut record.to_number, &event.to);
                if event.call_duration.is_some() {
                    record.duration_seconds = event.call_duration;
                }
                overwrite(&mut record.recording_url, &event.recording_url);
                overwrite(&mut record.transcript, &event.transcription_text);
                overwrite(&mut record.direction, &event.direction);
            },
        )
        .await?;

        // Redelivery of the same provider status is not a new event
        let progressed = upserted
            .previous
            .as_ref()
            .is_none_or(|previous| previous.provider_status != event.call_status.as_str());
        let record = upserted.entity;

        let notification = match event.call_status {
            CallStatus::Answered => Some((NotificationKind::CallAnswered, "Call answered")),
            CallStatus::Completed => Some((NotificationKind::CallCompleted, "Call completed")),
            _ => None,
        }
        .filter(|_| progressed)
        .map(|(kind, title)| Notification {
            kind,
            title: title.to_string(),
            body: format!(
                "Call {} from {}",
                event.call_sid,
                event.from.as_deref().unwrap_or("unknown caller")
            ),
            entity_id: record.meta.id,
            external_id: link.external_id.clone(),
        });

        Ok(outcome(&record, upserted.action, notification))
    }

    async fn sync_appointment(
        &self,
        link: ExternalLink,
        event: &CalendarEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let status = match event.status {
            CalendarEventStatus::Tentative => AppointmentStatus::Tentative,
            _ => AppointmentStatus::Scheduled,
        };
        let duration_minutes = event
            .end
            .as_datetime()
            .signed_duration_since(*event.start.as_datetime())
            .num_minutes()
            .max(MIN_APPOINTMENT_MINUTES);
        let customer = customer_attendee(event);

        let upserted = upsert(
            self.stores.appointments.as_ref(),
            &link,
            || Appointment {
                meta: EntityMeta::new(link.clone()),
                title: event.summary.clone(),
                starts_at: event.start,
                ends_at: event.end,
                duration_minutes,
                status,
                customer_email: None,
                customer_name: None,
                location: None,
                notes: None,
                cancelled_at: None,
            },
            |appointment| {
                appointment.title = event.summary.clone();
                appointment.starts_at = event.start;
                appointment.ends_at = event.end;
                appointment.duration_minutes = duration_minutes;
                appointment.status = status;
                appointment.cancelled_at = None;
                if let Some(attendee) = customer {
                    appointment.customer_email = attendee.email.clone();
                    overwrite(&mut appointment.customer_name, &attendee.display_name);
                }
                overwrite(&mut appointment.location, &event.location);
                overwrite(&mut appointment.notes, &event.description);
            },
        )
        .await?;

        let appointment = upserted.entity;
        let rescheduled = upserted.previous.as_ref().is_none_or(|previous| {
            previous.status != appointment.status
                || previous.title != appointment.title
                || previous.starts_at != appointment.starts_at
                || previous.ends_at != appointment.ends_at
        });

        let notification = rescheduled.then(|| Notification {
            kind: NotificationKind::AppointmentSynced,
            title: "Appointment synced".to_string(),
            body: format!("{} at {}", event.summary, event.start),
            entity_id: appointment.meta.id,
            external_id: link.external_id.clone(),
        });

        Ok(outcome(&appointment, upserted.action, notification))
    }

    async fn cancel_appointment(
        &self,
        link: ExternalLink,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let (appointment, action) = update_existing(
            self.stores.appointments.as_ref(),
            &link,
            |appointment| {
                if appointment.status == AppointmentStatus::Cancelled {
                    return false;
                }
                appointment.status = AppointmentStatus::Cancelled;
                appointment.cancelled_at = Some(Timestamp::now());
                true
            },
        )
        .await?;

        let notification = (action == ReconcileAction::Updated).then(|| Notification {
            kind: NotificationKind::AppointmentCancelled,
            title: "Appointment cancelled".to_string(),
            body: format!("{} on {}", appointment.title, appointment.starts_at),
            entity_id: appointment.meta.id,
            external_id: link.external_id.clone(),
        });

        Ok(outcome(&appointment, action, notification))
    }

    async fn apply_receipt(
        &self,
        link: ExternalLink,
        event: &SmsDeliveryEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let (message, action) = update_existing(
            self.stores.messages.as_ref(),
            &link,
            |message| {
                if message
                    .status_updated_at
                    .is_some_and(|applied| event.timestamp < applied)
                {
                    return false;
                }
                let Some(status) = message_status(event.status) else {
                    return false;
                };
                message.status = status;
                message.status_updated_at = Some(event.timestamp);
                overwrite(&mut message.error_code, &event.error_code);
                overwrite(&mut message.error_message, &event.error_message);
                true
            },
        )
        .await?;

        if action == ReconcileAction::Unchanged {
            debug!(status = event.status.as_str(), "Ignoring stale or neutral receipt");
        }

        let delivery_failed = matches!(
            event.status,
            SmsDeliveryStatus::Failed | SmsDeliveryStatus::Rejected
        );
        let notification = (action == ReconcileAction::Updated && delivery_failed).then(|| {
            Notification {
                kind: NotificationKind::SmsDeliveryFailed,
                title: "Message not delivered".to_string(),
                body: format!(
                    "Message to {} failed: {}",
                    message.to_number.as_deref().unwrap_or("unknown recipient"),
                    event
                        .error_message
                        .as_deref()
                        .or(event.error_code.as_deref())
                        .unwrap_or("no reason given")
                ),
                entity_id: message.meta.id,
                external_id: link.external_id.clone(),
            }
        });

        Ok(outcome(&message, action, notification))
    }

    async fn record_review(
        &self,
        link: ExternalLink,
        event: &ReviewEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let already_exists = || ReconcileError::AlreadyExists {
            entity: EntityKind::Review,
            external_id: link.external_id.clone(),
        };

        if self.stores.reviews.find_by_link(&link).await?.is_some() {
            return Err(already_exists());
        }

        let review = Review {
            meta: EntityMeta::new(link.clone()),
            platform: event.platform,
            rating: event.rating,
            reviewer_name: event.reviewer_name.clone(),
            text: event.review_text.clone(),
            url: event.review_url.clone(),
            reviewed_at: event.review_date,
        };

        match self.stores.reviews.insert(review).await {
            Ok(review) => Ok(outcome(&review, ReconcileAction::Created, None)),
            Err(StoreError::UniqueViolation { .. }) => Err(already_exists()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Status tables
// ============================================================================

fn call_record_status(status: CallStatus) -> CallRecordStatus {
    match status {
        CallStatus::Ringing | CallStatus::Initiated => CallRecordStatus::Ringing,
        CallStatus::Answered | CallStatus::Completed => CallRecordStatus::Completed,
        CallStatus::Busy | CallStatus::NoAnswer => CallRecordStatus::Missed,
        CallStatus::Failed => CallRecordStatus::Failed,
    }
}

/// `None` means the receipt carries no status change
fn message_status(status: SmsDeliveryStatus) -> Option<MessageStatus> {
    match status {
        SmsDeliveryStatus::Sent => Some(MessageStatus::Sent),
        SmsDeliveryStatus::Delivered => Some(MessageStatus::Delivered),
        SmsDeliveryStatus::Failed | SmsDeliveryStatus::Rejected => Some(MessageStatus::Failed),
        SmsDeliveryStatus::Expired => Some(MessageStatus::Undelivered),
        SmsDeliveryStatus::Unknown => None,
    }
}

/// First attendee who is not the organizer, else the first with an email
fn customer_attendee(event: &CalendarEvent) -> Option<&Attendee> {
    let is_organizer = |email: &str| {
        event
            .organizer_email
            .as_deref()
            .is_some_and(|organizer| organizer.eq_ignore_ascii_case(email))
    };

    event
        .attendees
        .iter()
        .find(|a| {
            !a.organizer && a.email.as_deref().is_some_and(|email| !is_organizer(email))
        })
        .or_else(|| event.attendees.iter().find(|a| a.email.is_some()))
}

// ============================================================================
// Find-or-create protocol
// ============================================================================

fn overwrite(target: &mut Option<String>, value: &Option<String>) {
    if value.is_some() {
        target.clone_from(value);
    }
}

fn outcome<E: StoredEntity>(
    entity: &E,
    action: ReconcileAction,
    notification: Option<Notification>,
) -> ReconcileOutcome {
    ReconcileOutcome {
        entity: E::KIND,
        entity_id: entity.meta().id,
        external_id: entity.meta().link.external_id.clone(),
        action,
        notification,
    }
}

/// Result of [`upsert`]
struct Upserted<E> {
    entity: E,
    action: ReconcileAction,
    /// The stored entity before `apply` ran; `None` when it was created
    previous: Option<E>,
}

/// Insert the entity for `link`, or apply `apply` to the existing one.
async fn upsert<E, C, A>(
    store: &dyn EntityStore<E>,
    link: &ExternalLink,
    create: C,
    apply: A,
) -> Result<Upserted<E>, ReconcileError>
where
    E: StoredEntity,
    C: Fn() -> E + Sync,
    A: Fn(&mut E) + Sync,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        match store.find_by_link(link).await? {
            Some(previous) => {
                let version = previous.meta().version;
                let mut existing = previous.clone();
                apply(&mut existing);
                match store.update(existing, version).await {
                    Ok(entity) => {
                        return Ok(Upserted {
                            entity,
                            action: ReconcileAction::Updated,
                            previous: Some(previous),
                        })
                    }
                    Err(StoreError::VersionConflict { .. }) => {
                        warn!(attempt, link = %link, "Version conflict, re-reading");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            None => {
                let mut entity = create();
                apply(&mut entity);
                match store.insert(entity).await {
                    Ok(entity) => {
                        return Ok(Upserted {
                            entity,
                            action: ReconcileAction::Created,
                            previous: None,
                        })
                    }
                    Err(StoreError::UniqueViolation { .. }) => {
                        debug!(attempt, link = %link, "Lost insert race, updating instead");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Err(ReconcileError::ConcurrentModification {
        entity: E::KIND,
        external_id: link.external_id.clone(),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}

/// Apply `apply` to the existing entity for `link`; never creates one.
///
/// `apply` returns `false` when the event changes nothing.
async fn update_existing<E, A>(
    store: &dyn EntityStore<E>,
    link: &ExternalLink,
    apply: A,
) -> Result<(E, ReconcileAction), ReconcileError>
where
    E: StoredEntity,
    A: Fn(&mut E) -> bool + Sync,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let Some(mut existing) = store.find_by_link(link).await? else {
            return Err(ReconcileError::EntityNotFound {
                entity: E::KIND,
                external_id: link.external_id.clone(),
            });
        };

        let version = existing.meta().version;
        if !apply(&mut existing) {
            return Ok((existing, ReconcileAction::Unchanged));
        }

        match store.update(existing, version).await {
            Ok(stored) => return Ok((stored, ReconcileAction::Updated)),
            Err(StoreError::VersionConflict { .. }) => {
                warn!(attempt, link = %link, "Version conflict, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(ReconcileError::ConcurrentModification {
        entity: E::KIND,
        external_id: link.external_id.clone(),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod tests;
