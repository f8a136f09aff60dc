//! Tests for tenant resolution.

use super::*;
use crate::schema::{self, TypedEnvelope};
use crate::WebhookSource;
use serde_json::json;

fn acme() -> TenantId {
    TenantId::new("acme-dental").unwrap()
}

fn directory() -> Arc<InMemoryTenantDirectory> {
    let records = vec![
        TenantRecord {
            id: acme(),
            phone_numbers: vec!["(555) 987-6543".to_string()],
            calendar_ids: vec!["acme@group.calendar.example.com".to_string()],
            emails: vec!["Front-Desk@Acme-Dental.com".to_string()],
        },
        TenantRecord {
            id: TenantId::new("bright-smiles").unwrap(),
            phone_numbers: vec!["+15551234567".to_string()],
            calendar_ids: vec![],
            emails: vec![],
        },
    ];
    Arc::new(InMemoryTenantDirectory::from_records(&records).unwrap())
}

fn resolver() -> BusinessResolver {
    BusinessResolver::new(directory())
}

fn envelope(source: WebhookSource, payload: serde_json::Value) -> TypedEnvelope {
    schema::parse(source, &payload).unwrap()
}

fn calendar_payload() -> serde_json::Value {
    json!({
        "id": "evt_1",
        "summary": "Checkup",
        "start": { "dateTime": "2024-05-01T10:00:00Z" },
        "end": { "dateTime": "2024-05-01T10:30:00Z" },
        "status": "confirmed"
    })
}

mod phone_numbers {
    use super::*;

    /// Verify common formats normalise to the same key.
    #[test]
    fn test_normalize_phone_formats() {
        assert_eq!(normalize_phone("+1 (555) 987-6543").as_deref(), Some("+15559876543"));
        assert_eq!(normalize_phone("555.987.6543").as_deref(), Some("+15559876543"));
        assert_eq!(normalize_phone("+442079460958").as_deref(), Some("+442079460958"));
        assert_eq!(normalize_phone("anonymous"), None);
        assert_eq!(normalize_phone("client:alice"), None);
    }

    /// Verify telephony prefers the called number.
    #[tokio::test]
    async fn test_telephony_resolves_by_to_before_from() {
        let envelope = envelope(
            WebhookSource::Telephony,
            json!({
                "CallSid": "CA1",
                "CallStatus": "answered",
                "From": "+15551234567",
                "To": "+15559876543"
            }),
        );

        let resolution = resolver()
            .resolve(&envelope, &ResolutionHints::default())
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::Tenant(acme()));
    }

    /// Verify telephony falls back to the caller number.
    #[tokio::test]
    async fn test_telephony_falls_back_to_from() {
        let envelope = envelope(
            WebhookSource::Telephony,
            json!({ "CallSid": "CA2", "CallStatus": "ringing", "From": "5559876543", "To": "+19990000000" }),
        );

        let resolution = resolver()
            .resolve(&envelope, &ResolutionHints::default())
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::Tenant(acme()));
    }

    /// Verify SMS receipts prefer the sending number.
    #[tokio::test]
    async fn test_sms_resolves_by_from_before_to() {
        let envelope = envelope(
            WebhookSource::SmsDelivery,
            json!({
                "messageId": "SM1",
                "status": "delivered",
                "timestamp": "2024-05-01T10:00:00Z",
                "from": "+15551234567",
                "to": "+15559876543"
            }),
        );

        let resolution = resolver()
            .resolve(&envelope, &ResolutionHints::default())
            .await
            .unwrap();
        assert_eq!(
            resolution,
            TenantResolution::Tenant(TenantId::new("bright-smiles").unwrap())
        );
    }

    /// Verify unknown numbers resolve to NotFound rather than an error.
    #[tokio::test]
    async fn test_unknown_number_is_not_found() {
        let envelope = envelope(
            WebhookSource::Telephony,
            json!({ "CallSid": "CA3", "CallStatus": "busy", "From": "+18005550000" }),
        );

        let resolution = resolver()
            .resolve(&envelope, &ResolutionHints::default())
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::NotFound);
    }
}

mod payload_identifiers {
    use super::*;

    /// Verify reviews resolve only to existing tenants.
    #[tokio::test]
    async fn test_review_business_id_must_exist() {
        let known = envelope(
            WebhookSource::ReviewPlatform,
            json!({ "reviewId": "r1", "businessId": "acme-dental", "reviewRating": 4, "platform": "yelp" }),
        );
        let unknown = envelope(
            WebhookSource::ReviewPlatform,
            json!({ "reviewId": "r1", "businessId": "ghost-clinic", "reviewRating": 4, "platform": "yelp" }),
        );

        let resolver = resolver();
        assert_eq!(
            resolver.resolve(&known, &ResolutionHints::default()).await.unwrap(),
            TenantResolution::Tenant(acme())
        );
        assert_eq!(
            resolver.resolve(&unknown, &ResolutionHints::default()).await.unwrap(),
            TenantResolution::NotFound
        );
    }

    /// Verify calendar events resolve by calendar id.
    #[tokio::test]
    async fn test_calendar_resolves_by_calendar_id() {
        let mut payload = calendar_payload();
        payload["calendarId"] = json!("acme@group.calendar.example.com");

        let resolution = resolver()
            .resolve(&envelope(WebhookSource::Calendar, payload), &ResolutionHints::default())
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::Tenant(acme()));
    }

    /// Verify calendar events fall back to the organizer email, ignoring case.
    #[tokio::test]
    async fn test_calendar_falls_back_to_organizer_email() {
        let mut payload = calendar_payload();
        payload["calendarId"] = json!("unknown@group.calendar.example.com");
        payload["organizer"] = json!({ "email": "front-desk@acme-dental.com" });

        let resolution = resolver()
            .resolve(&envelope(WebhookSource::Calendar, payload), &ResolutionHints::default())
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::Tenant(acme()));
    }
}

mod tokens {
    use super::*;

    /// Verify a valid token wins over payload identifiers.
    #[tokio::test]
    async fn test_token_takes_priority() {
        let mut payload = calendar_payload();
        payload["calendarId"] = json!("acme@group.calendar.example.com");
        let hints = ResolutionHints {
            tenant_token: Some("bright-smiles".to_string()),
        };

        let resolution = resolver()
            .resolve(&envelope(WebhookSource::Calendar, payload), &hints)
            .await
            .unwrap();
        assert_eq!(
            resolution,
            TenantResolution::Tenant(TenantId::new("bright-smiles").unwrap())
        );
    }

    /// Verify tokens naming unknown tenants are ignored.
    #[tokio::test]
    async fn test_unknown_token_is_ignored() {
        let mut payload = calendar_payload();
        payload["calendarId"] = json!("acme@group.calendar.example.com");
        let hints = ResolutionHints {
            tenant_token: Some("../../admin".to_string()),
        };

        let resolution = resolver()
            .resolve(&envelope(WebhookSource::Calendar, payload), &hints)
            .await
            .unwrap();
        assert_eq!(resolution, TenantResolution::Tenant(acme()));
    }
}

/// Verify that one phone number cannot belong to two tenants.
#[test]
fn test_directory_rejects_shared_phone_number() {
    let records = vec![
        TenantRecord {
            id: acme(),
            phone_numbers: vec!["+15559876543".to_string()],
            calendar_ids: vec![],
            emails: vec![],
        },
        TenantRecord {
            id: TenantId::new("copycat").unwrap(),
            phone_numbers: vec!["555-987-6543".to_string()],
            calendar_ids: vec![],
            emails: vec![],
        },
    ];

    let err = InMemoryTenantDirectory::from_records(&records).unwrap_err();
    assert!(matches!(err, ResolverError::DuplicateMapping { .. }));
}
