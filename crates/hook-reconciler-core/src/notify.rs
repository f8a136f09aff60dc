//! # Internal Notifications
//!
//! Side effects raised after a successful reconciliation (a call was
//! answered, a message bounced, an appointment moved). Delivery is best
//! effort: [`NotificationEmitter::emit`] never fails, it logs sink errors at
//! `warn` and reports whether delivery happened.

use crate::{EntityId, TenantId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CallAnswered,
    CallCompleted,
    SmsDeliveryFailed,
    AppointmentSynced,
    AppointmentCancelled,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallAnswered => "call_answered",
            Self::CallCompleted => "call_completed",
            Self::SmsDeliveryFailed => "sms_delivery_failed",
            Self::AppointmentSynced => "appointment_synced",
            Self::AppointmentCancelled => "appointment_cancelled",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message for the tenant's staff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub entity_id: EntityId,
    pub external_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("Notification sink unavailable: {message}")]
    SinkUnavailable { message: String },
}

/// Destination for tenant notifications
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        tenant_id: &TenantId,
        notification: &Notification,
    ) -> Result<(), NotificationError>;
}

/// Best-effort front end over a [`NotificationSink`]
#[derive(Clone)]
pub struct NotificationEmitter {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationEmitter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Deliver a notification; returns `false` if the sink failed.
    pub async fn emit(&self, tenant_id: &TenantId, notification: &Notification) -> bool {
        match self.sink.deliver(tenant_id, notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    kind = %notification.kind,
                    external_id = %notification.external_id,
                    error = %e,
                    "Failed to deliver notification"
                );
                false
            }
        }
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Sink that writes notifications to the log
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn deliver(
        &self,
        tenant_id: &TenantId,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        info!(
            tenant_id = %tenant_id,
            kind = %notification.kind,
            entity_id = %notification.entity_id,
            title = %notification.title,
            "Notification"
        );
        Ok(())
    }
}

/// Sink that keeps delivered notifications in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationSink {
    delivered: Arc<RwLock<Vec<(TenantId, Notification)>>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(TenantId, Notification)> {
        self.delivered
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn deliver(
        &self,
        tenant_id: &TenantId,
        notification: &Notification,
    ) -> Result<(), NotificationError> {
        let mut delivered = self
            .delivered
            .write()
            .map_err(|_| NotificationError::SinkUnavailable {
                message: "notification buffer lock poisoned".to_string(),
            })?;
        delivered.push((tenant_id.clone(), notification.clone()));
        Ok(())
    }
}

#[cfg(test)]
#[path = "notify_tests.rs"]
mod tests;
