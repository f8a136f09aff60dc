//! Common test utilities for hook-reconciler integration tests
//!
//! This module provides:
//! - A fully wired router backed by in-memory stores the tests can inspect
//! - Signed request builders for every provider family
//! - Failing store doubles for collaborator outages

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use hook_reconciler_api::{
    create_router, AppState, ProviderConfig, SecretSource, ServiceConfig, ServiceMetrics,
};
use hook_reconciler_core::{
    signature::{self, SignatureScheme},
    store::{
        Appointment, CallRecord, ConversationMessage, InMemoryEntityStore, Review, StoredEntity,
    },
    BusinessStores, EntityStore, ExternalLink, InMemoryAttemptStore, InMemoryNotificationSink,
    SignatureAlgorithm, StoreError, TenantId, TenantRecord, VerificationContext,
};
use serde_json::Value;
use std::sync::Arc;
use zeroize::Zeroizing;

pub const TELEPHONY_SECRET: &str = "integration-telephony";
pub const CALENDAR_SECRET: &str = "integration-calendar";
pub const SMS_SECRET: &str = "integration-sms";
pub const REVIEW_SECRET: &str = "integration-reviews";
pub const HOST: &str = "hooks.acme.test";

pub const TENANT: &str = "acme-dental";
pub const TENANT_PHONE: &str = "+15559876543";
pub const TENANT_CALENDAR: &str = "acme@calendar.example.com";

pub fn tenant() -> TenantId {
    TenantId::new(TENANT).unwrap()
}

fn literal(secret: &str, algorithm: SignatureAlgorithm) -> ProviderConfig {
    ProviderConfig {
        secret: SecretSource::Literal {
            value: Zeroizing::new(secret.to_string()),
        },
        algorithm,
    }
}

/// Configuration with every provider signed and one tenant.
pub fn service_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.server.max_body_size = 16 * 1024;
    config.providers.telephony = Some(literal(TELEPHONY_SECRET, SignatureAlgorithm::HmacSha1));
    config.providers.calendar = Some(literal(CALENDAR_SECRET, SignatureAlgorithm::HmacSha256));
    config.providers.sms = Some(literal(SMS_SECRET, SignatureAlgorithm::HmacSha256));
    config.providers.reviews = Some(literal(REVIEW_SECRET, SignatureAlgorithm::HmacSha1));
    config.tenants = vec![TenantRecord {
        id: tenant(),
        phone_numbers: vec![TENANT_PHONE.to_string()],
        calendar_ids: vec![TENANT_CALENDAR.to_string()],
        emails: vec!["frontdesk@acme.test".to_string()],
    }];
    config
}

// ============================================================================
// Test service
// ============================================================================

/// Router plus handles on the stores behind it
pub struct TestService {
    pub router: Router,
    pub attempts: Arc<InMemoryAttemptStore>,
    pub calls: Arc<InMemoryEntityStore<CallRecord>>,
    pub appointments: Arc<InMemoryEntityStore<Appointment>>,
    pub messages: Arc<InMemoryEntityStore<ConversationMessage>>,
    pub reviews: Arc<InMemoryEntityStore<Review>>,
    pub notifications: InMemoryNotificationSink,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(service_config())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        let calls = Arc::new(InMemoryEntityStore::new());
        let appointments = Arc::new(InMemoryEntityStore::new());
        let messages = Arc::new(InMemoryEntityStore::new());
        let reviews = Arc::new(InMemoryEntityStore::new());
        let stores = BusinessStores {
            calls: calls.clone(),
            appointments: appointments.clone(),
            messages: messages.clone(),
            reviews: reviews.clone(),
        };
        let attempts = Arc::new(InMemoryAttemptStore::new());
        let notifications = InMemoryNotificationSink::new();

        let router = build_router(config, stores, attempts.clone(), notifications.clone());

        Self {
            router,
            attempts,
            calls,
            appointments,
            messages,
            reviews,
            notifications,
        }
    }

    /// Send one request through a clone of the router.
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        use tower::ServiceExt;
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn send_json(&self, request: Request<Body>) -> Value {
        json(self.send(request).await).await
    }
}

pub fn build_router(
    config: ServiceConfig,
    stores: BusinessStores,
    attempts: Arc<InMemoryAttemptStore>,
    notifications: InMemoryNotificationSink,
) -> Router {
    let pipeline = config
        .build_pipeline(stores, attempts, Arc::new(notifications))
        .unwrap();
    let metrics = ServiceMetrics::new().unwrap();
    create_router(AppState::new(config, pipeline, metrics))
}

// ============================================================================
// Signed requests
// ============================================================================

pub fn telephony(body: &str) -> Request<Body> {
    let url = format!("https://{HOST}/webhooks/telephony");
    let signature = signature::sign(
        &SignatureScheme::UrlAndBody,
        body.as_bytes(),
        TELEPHONY_SECRET,
        &VerificationContext::with_url(url),
    )
    .unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/telephony")
        .header("host", HOST)
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-telephony-signature", signature)
        .header("x-forwarded-for", "198.51.100.7, 10.0.0.1")
        .header("user-agent", "TelephonyProxy/1.1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn calendar(body: &Value) -> Request<Body> {
    calendar_at(body, chrono::Utc::now().timestamp())
}

pub fn calendar_at(body: &Value, unix_seconds: i64) -> Request<Body> {
    let raw = body.to_string();
    let timestamp = unix_seconds.to_string();
    let signature = signature::sign(
        &SignatureScheme::TimestampAndBody,
        raw.as_bytes(),
        CALENDAR_SECRET,
        &VerificationContext::with_timestamp(timestamp.clone()),
    )
    .unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhooks/calendar")
        .header("content-type", "application/json")
        .header("x-calendar-signature", signature)
        .header("x-calendar-timestamp", timestamp)
        .body(Body::from(raw))
        .unwrap()
}

pub fn sms(body: &Value) -> Request<Body> {
    body_signed(
        "/webhooks/sms",
        "x-sms-signature",
        SMS_SECRET,
        SignatureAlgorithm::HmacSha256,
        body,
    )
}

pub fn review(body: &Value) -> Request<Body> {
    body_signed(
        "/webhooks/reviews",
        "x-review-signature",
        REVIEW_SECRET,
        SignatureAlgorithm::HmacSha1,
        body,
    )
}

fn body_signed(
    path: &str,
    header: &str,
    secret: &str,
    algorithm: SignatureAlgorithm,
    body: &Value,
) -> Request<Body> {
    let raw = body.to_string();
    let signature = signature::sign(
        &SignatureScheme::Body { algorithm },
        raw.as_bytes(),
        secret,
        &VerificationContext::default(),
    )
    .unwrap();
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(header, signature)
        .body(Body::from(raw))
        .unwrap()
}

pub fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

pub fn post(path: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

pub async fn json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Payload builders
// ============================================================================

pub fn appointment_event(id: &str, status: &str) -> Value {
    serde_json::json!({
        "id": id,
        "summary": "Cleaning",
        "start": { "dateTime": "2024-06-03T09:00:00Z" },
        "end": { "dateTime": "2024-06-03T09:45:00Z" },
        "status": status,
        "calendarId": TENANT_CALENDAR,
        "attendees": [
            { "email": "patient@example.com", "displayName": "Pat Patient" }
        ]
    })
}

pub fn delivery_receipt(message_id: &str, status: &str, timestamp: &str) -> Value {
    serde_json::json!({
        "messageId": message_id,
        "status": status,
        "timestamp": timestamp,
        "from": TENANT_PHONE,
        "to": "+15551234567"
    })
}

pub fn review_event(review_id: &str, rating: i64) -> Value {
    serde_json::json!({
        "reviewId": review_id,
        "businessId": TENANT,
        "reviewRating": rating,
        "platform": "google",
        "reviewerName": "Sam",
        "reviewText": "Friendly staff"
    })
}

pub fn outbound_message(message_id: &str) -> ConversationMessage {
    ConversationMessage::outbound(
        ExternalLink::new(
            hook_reconciler_core::WebhookSource::SmsDelivery,
            message_id,
            tenant(),
        ),
        "+15551234567",
        "Reminder: your appointment is tomorrow",
    )
}

// ============================================================================
// Failing collaborators
// ============================================================================

/// Entity store whose every operation reports an outage
pub struct UnavailableStore;

#[async_trait]
impl<E: StoredEntity + 'static> EntityStore<E> for UnavailableStore {
    async fn find_by_link(&self, _link: &ExternalLink) -> Result<Option<E>, StoreError> {
        Err(outage())
    }

    async fn insert(&self, _entity: E) -> Result<E, StoreError> {
        Err(outage())
    }

    async fn update(&self, _entity: E, _expected_version: u64) -> Result<E, StoreError> {
        Err(outage())
    }
}

fn outage() -> StoreError {
    StoreError::Unavailable {
        message: "connection refused by db-primary.internal:5432".to_string(),
    }
}
