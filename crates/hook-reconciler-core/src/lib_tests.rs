//! Tests for the shared core types.

use super::*;

#[test]
fn test_attempt_id_round_trips_through_string() {
    let id = AttemptId::new();
    let parsed: AttemptId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn test_attempt_id_rejects_garbage() {
    assert!("not-a-ulid".parse::<AttemptId>().is_err());
}

#[test]
fn test_tenant_id_validation() {
    assert!(TenantId::new("acme-dental_01").is_ok());
    assert!(matches!(
        TenantId::new(""),
        Err(ValidationError::Required { .. })
    ));
    assert!(matches!(
        TenantId::new("acme dental"),
        Err(ValidationError::InvalidCharacters { .. })
    ));
    assert!(matches!(
        TenantId::new("a".repeat(129)),
        Err(ValidationError::TooLong { .. })
    ));
}

#[test]
fn test_tenant_id_deserialization_is_validated() {
    let ok: Result<TenantId, _> = serde_json::from_str("\"tenant-1\"");
    assert!(ok.is_ok());

    let bad: Result<TenantId, _> = serde_json::from_str("\"../etc\"");
    assert!(bad.is_err());
}

#[test]
fn test_webhook_source_parsing_accepts_aliases() {
    assert_eq!(
        "sms".parse::<WebhookSource>().unwrap(),
        WebhookSource::SmsDelivery
    );
    assert_eq!(
        "Review-Platform".parse::<WebhookSource>().unwrap(),
        WebhookSource::ReviewPlatform
    );
    assert!("fax".parse::<WebhookSource>().is_err());
}

#[test]
fn test_webhook_source_serializes_kebab_case() {
    let json = serde_json::to_string(&WebhookSource::SmsDelivery).unwrap();
    assert_eq!(json, "\"sms-delivery\"");
}

#[test]
fn test_only_authentication_failures_are_not_replayable() {
    assert!(!FailureKind::Authentication.is_replayable());
    assert!(FailureKind::Validation.is_replayable());
    assert!(FailureKind::Resolution.is_replayable());
    assert!(FailureKind::Conflict.is_replayable());
    assert!(FailureKind::Downstream.is_replayable());
}

#[test]
fn test_timestamp_ordering_and_parsing() {
    let earlier = Timestamp::from_rfc3339("2024-03-01T10:00:00+02:00").unwrap();
    let later = Timestamp::from_rfc3339("2024-03-01T09:00:00Z").unwrap();
    assert!(earlier < later);
    assert!(Timestamp::from_rfc3339("2024-03-01 10:00").is_err());
}

/// Verify that caller-supplied correlation ids are kept only when usable.
#[test]
fn test_correlation_id_from_inbound() {
    assert_eq!(
        CorrelationId::from_inbound(Some(" req-123 ")).as_str(),
        "req-123"
    );

    for unusable in [None, Some(""), Some("has space"), Some("tab\tid")] {
        let generated = CorrelationId::from_inbound(unusable);
        assert!(Uuid::parse_str(generated.as_str()).is_ok(), "{unusable:?}");
    }

    let too_long = "a".repeat(CorrelationId::MAX_LENGTH + 1);
    assert_ne!(CorrelationId::from_inbound(Some(&too_long)).as_str(), too_long);
}
