//! Tests for the in-memory entity store.

use super::*;

fn tenant() -> TenantId {
    TenantId::new("acme-dental").unwrap()
}

fn call(external_id: &str) -> CallRecord {
    CallRecord {
        meta: EntityMeta::new(ExternalLink::new(
            WebhookSource::Telephony,
            external_id,
            tenant(),
        )),
        status: CallRecordStatus::Ringing,
        provider_status: "ringing".to_string(),
        from_number: Some("+15551234567".to_string()),
        to_number: None,
        duration_seconds: None,
        recording_url: None,
        transcript: None,
        direction: None,
    }
}

/// Verify that an inserted entity can be found by its link.
#[tokio::test]
async fn test_insert_then_find_by_link() {
    let store = InMemoryEntityStore::<CallRecord>::new();
    let record = call("CA1");

    store.insert(record.clone()).await.unwrap();

    let found = store.find_by_link(&record.meta.link).await.unwrap();
    assert_eq!(found, Some(record));
}

/// Verify that a second insert for the same link is a unique violation.
#[tokio::test]
async fn test_duplicate_link_is_unique_violation() {
    let store = InMemoryEntityStore::<CallRecord>::new();
    store.insert(call("CA1")).await.unwrap();

    let err = store.insert(call("CA1")).await.unwrap_err();
    assert!(matches!(err, StoreError::UniqueViolation { .. }));
    assert_eq!(store.len(), 1);
}

/// Verify that the same external id under another tenant is a different link.
#[tokio::test]
async fn test_links_are_tenant_scoped() {
    let store = InMemoryEntityStore::<CallRecord>::new();
    store.insert(call("CA1")).await.unwrap();

    let mut other = call("CA1");
    other.meta.link.tenant_id = TenantId::new("other-clinic").unwrap();
    store.insert(other).await.unwrap();

    assert_eq!(store.len(), 2);
    let link = ExternalLink::new(WebhookSource::Telephony, "CA1", tenant());
    let found = store.find_by_link(&link).await.unwrap().unwrap();
    assert_eq!(found.meta.link.tenant_id, tenant());
}

/// Verify that updates bump the version.
#[tokio::test]
async fn test_update_increments_version() {
    let store = InMemoryEntityStore::<CallRecord>::new();
    let mut record = store.insert(call("CA1")).await.unwrap();
    record.status = CallRecordStatus::Completed;

    let updated = store.update(record, 1).await.unwrap();
    assert_eq!(updated.meta.version, 2);
    assert_eq!(updated.status, CallRecordStatus::Completed);
}

/// Verify that a stale version is refused.
#[tokio::test]
async fn test_stale_update_is_version_conflict() {
    let store = InMemoryEntityStore::<CallRecord>::new();
    let record = store.insert(call("CA1")).await.unwrap();
    store.update(record.clone(), 1).await.unwrap();

    let err = store.update(record, 1).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionConflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    assert!(err.is_transient());
}

/// Verify that updating a missing entity is reported.
#[tokio::test]
async fn test_update_missing_entity_is_not_found() {
    let store = InMemoryEntityStore::<CallRecord>::new();
    let err = store.update(call("CA404"), 1).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert!(!err.is_transient());
}

/// Verify that concurrent inserts for one link leave exactly one entity.
#[tokio::test]
async fn test_concurrent_inserts_leave_one_entity() {
    let store = Arc::new(InMemoryEntityStore::<CallRecord>::new());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.insert(call("CA-race")).await }));
    }

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(store.len(), 1);
}

/// Verify the entity kind for each source.
#[test]
fn test_entity_kind_for_source() {
    assert_eq!(EntityKind::for_source(WebhookSource::Telephony), EntityKind::Call);
    assert_eq!(
        EntityKind::for_source(WebhookSource::SmsDelivery),
        EntityKind::Message
    );
    assert_eq!(CallRecord::KIND.as_str(), "call");
}
