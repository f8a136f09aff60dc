//! Tests for routing, response shaping and the admin API.

use super::*;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use hook_reconciler_core::{
    signature::{self, SignatureScheme},
    BusinessStores, InMemoryAttemptStore, InMemoryNotificationSink, SignatureAlgorithm,
    TenantRecord,
};
use serde_json::Value;
use tower::ServiceExt;
use zeroize::Zeroizing;

const TELEPHONY_SECRET: &str = "tel-secret";
const REVIEW_SECRET: &str = "review-secret";
const SMS_SECRET: &str = "sms-secret";
const HOST: &str = "hooks.example.com";
const ANSWERED_CALL: &str = "CallSid=CA1&CallStatus=answered&From=%2B15551234567&To=%2B15559876543";

fn literal(value: &str) -> ProviderConfig {
    ProviderConfig {
        secret: SecretSource::Literal {
            value: Zeroizing::new(value.to_string()),
        },
        algorithm: SignatureAlgorithm::HmacSha256,
    }
}

fn test_config() -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.server.max_body_size = 4 * 1024;
    config.providers.telephony = Some(literal(TELEPHONY_SECRET));
    config.providers.sms = Some(literal(SMS_SECRET));
    config.providers.reviews = Some(ProviderConfig {
        algorithm: SignatureAlgorithm::HmacSha1,
        ..literal(REVIEW_SECRET)
    });
    config.tenants = vec![TenantRecord {
        id: TenantId::new("acme-dental").unwrap(),
        phone_numbers: vec!["+15559876543".to_string()],
        calendar_ids: vec![],
        emails: vec![],
    }];
    config
}

fn app_with(config: ServiceConfig) -> Router {
    let pipeline = config
        .build_pipeline(
            BusinessStores::in_memory(),
            Arc::new(InMemoryAttemptStore::new()),
            Arc::new(InMemoryNotificationSink::new()),
        )
        .unwrap();
    let metrics = ServiceMetrics::new().unwrap();
    create_router(AppState::new(config, pipeline, metrics))
}

fn app() -> Router {
    app_with(test_config())
}

fn telephony_request(body: &str, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/telephony")
        .header("host", HOST)
        .header("content-type", "application/x-www-form-urlencoded")
        .header("x-telephony-signature", signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn telephony_signature(body: &str) -> String {
    signature::sign(
        &SignatureScheme::UrlAndBody,
        body.as_bytes(),
        TELEPHONY_SECRET,
        &VerificationContext::with_url(format!("https://{HOST}/webhooks/telephony")),
    )
    .unwrap()
}

fn body_signed(
    path: &str,
    header: &str,
    secret: &str,
    algorithm: SignatureAlgorithm,
    body: &str,
) -> Request<Body> {
    let signature = signature::sign(
        &SignatureScheme::Body { algorithm },
        body.as_bytes(),
        secret,
        &VerificationContext::default(),
    )
    .unwrap();
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(header, signature)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get_request(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

// ============================================================================
// Webhook routes
// ============================================================================

mod webhook_routes {
    use super::*;

    /// Verify that a valid telephony callback updates the call.
    #[tokio::test]
    async fn test_valid_telephony_callback() {
        let response = app()
            .oneshot(telephony_request(
                ANSWERED_CALL,
                &telephony_signature(ANSWERED_CALL),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["callUpdated"], true);
        assert_eq!(body["callCreated"], true);
        assert!(body["attemptId"].is_string());
    }

    /// Verify that a bad signature is answered with 401.
    #[tokio::test]
    async fn test_bad_signature_is_unauthorized() {
        let response = app()
            .oneshot(telephony_request(ANSWERED_CALL, "bm90LWEtc2lnbmF0dXJl"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Invalid signature");
    }

    /// Verify that the public base URL is what gets verified.
    #[tokio::test]
    async fn test_public_base_url_overrides_host() {
        let mut config = test_config();
        config.webhooks.public_base_url = Some("https://public.example.org/".to_string());
        let signature = signature::sign(
            &SignatureScheme::UrlAndBody,
            ANSWERED_CALL.as_bytes(),
            TELEPHONY_SECRET,
            &VerificationContext::with_url("https://public.example.org/webhooks/telephony"),
        )
        .unwrap();

        let response = app_with(config)
            .oneshot(telephony_request(ANSWERED_CALL, &signature))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Verify that schema failures are answered with 400 and the field path.
    #[tokio::test]
    async fn test_invalid_review_is_bad_request() {
        let body = r#"{"reviewId":"r1","businessId":"acme-dental","reviewRating":6,"platform":"google"}"#;
        let response = app()
            .oneshot(body_signed(
                "/webhooks/reviews",
                "x-review-signature",
                REVIEW_SECRET,
                SignatureAlgorithm::HmacSha1,
                body,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["field"], "reviewRating");
        assert!(body["attemptId"].is_string());
    }

    /// Verify that a duplicate review is a 200 with a distinguishable reason.
    #[tokio::test]
    async fn test_duplicate_review_is_ok_with_reason() {
        let app = app();
        let body = r#"{"reviewId":"r9","businessId":"acme-dental","reviewRating":5,"platform":"google"}"#;
        let request = || {
            body_signed(
                "/webhooks/reviews",
                "x-signature",
                REVIEW_SECRET,
                SignatureAlgorithm::HmacSha1,
                body,
            )
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(json_body(first).await["reviewCreated"], true);

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let body = json_body(second).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["reason"], "already_exists");
        assert_eq!(body["reviewUpdated"], false);
    }

    /// Verify that the generic signature header is accepted for SMS receipts.
    #[tokio::test]
    async fn test_sms_generic_signature_header() {
        let body = r#"{"messageId":"SM404","status":"delivered","timestamp":"2024-05-01T10:00:00Z","from":"+15559876543"}"#;
        let response = app()
            .oneshot(body_signed(
                "/webhooks/sms",
                "x-signature",
                SMS_SECRET,
                SignatureAlgorithm::HmacSha256,
                body,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["reason"], "not_found");
        assert_eq!(body["messageUpdated"], false);
    }

    /// Verify that a provider without a secret is rejected.
    #[tokio::test]
    async fn test_unconfigured_calendar_is_unauthorized() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/calendar")
            .header("x-calendar-signature", "abc")
            .header("x-calendar-timestamp", "1714557600")
            .body(Body::from("{}"))
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    /// Verify that oversized bodies are rejected with 413.
    #[tokio::test]
    async fn test_oversized_body() {
        let body = "x".repeat(8 * 1024);
        let response = app()
            .oneshot(telephony_request(&body, "irrelevant"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}

// ============================================================================
// Operational routes
// ============================================================================

mod operational_routes {
    use super::*;

    /// Verify that the health endpoint always answers.
    #[tokio::test]
    async fn test_health() {
        let response = app().oneshot(get_request("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    /// Verify that readiness lists the configured providers.
    #[tokio::test]
    async fn test_ready_with_providers() {
        let response = app().oneshot(get_request("/ready")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(
            body["providers"],
            serde_json::json!(["telephony", "sms-delivery", "review-platform"])
        );
    }

    /// Verify that a service without providers is not ready.
    #[tokio::test]
    async fn test_not_ready_without_providers() {
        let response = app_with(ServiceConfig::default())
            .oneshot(get_request("/ready"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    /// Verify that the inbound correlation id is echoed back.
    #[tokio::test]
    async fn test_correlation_id_is_echoed() {
        let request = Request::builder()
            .uri("/health")
            .header(CORRELATION_ID_HEADER, "req-123")
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).unwrap(),
            "req-123"
        );
    }

    /// Verify that an unusable inbound correlation id is replaced.
    #[tokio::test]
    async fn test_oversized_correlation_id_is_replaced() {
        let inbound = "x".repeat(CorrelationId::MAX_LENGTH + 1);
        let request = Request::builder()
            .uri("/health")
            .header(CORRELATION_ID_HEADER, inbound.as_str())
            .body(Body::empty())
            .unwrap();

        let response = app().oneshot(request).await.unwrap();
        let echoed = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert_ne!(echoed, inbound);
        assert!(hook_reconciler_core::Uuid::parse_str(echoed).is_ok());
    }

    /// Verify that metrics reflect processed webhooks.
    #[tokio::test]
    async fn test_metrics_after_webhook() {
        let app = app();
        app.clone()
            .oneshot(telephony_request(ANSWERED_CALL, "bad"))
            .await
            .unwrap();

        let response = app.oneshot(get_request("/metrics")).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("hook_reconciler_signature_failures_total{source=\"telephony\"} 1"));
    }
}

// ============================================================================
// Admin routes
// ============================================================================

mod admin_routes {
    use super::*;

    /// Verify that attempts can be listed, filtered and fetched.
    #[tokio::test]
    async fn test_list_and_get_attempts() {
        let app = app();
        app.clone()
            .oneshot(telephony_request(
                ANSWERED_CALL,
                &telephony_signature(ANSWERED_CALL),
            ))
            .await
            .unwrap();
        app.clone()
            .oneshot(telephony_request(ANSWERED_CALL, "bad"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(get_request("/admin/attempts?status=failed&source=telephony"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let list = json_body(response).await;
        assert_eq!(list["total"], 1);
        let id = list["attempts"][0]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(get_request(&format!("/admin/attempts/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let detail = json_body(response).await;
        assert_eq!(detail["attempt"]["failure_kind"], "authentication");
    }

    /// Verify that bad filters are rejected.
    #[tokio::test]
    async fn test_invalid_filter() {
        let response = app()
            .oneshot(get_request("/admin/attempts?status=exploded"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// Verify that unknown attempts are 404.
    #[tokio::test]
    async fn test_unknown_attempt() {
        let response = app()
            .oneshot(get_request(&format!("/admin/attempts/{}", AttemptId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Verify that authentication rejections cannot be retried.
    #[tokio::test]
    async fn test_retry_refuses_authentication_failures() {
        let app = app();
        let rejected = app
            .clone()
            .oneshot(telephony_request(ANSWERED_CALL, "bad"))
            .await
            .unwrap();
        let id = json_body(rejected).await["attemptId"]
            .as_str()
            .unwrap()
            .to_string();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/admin/attempts/{id}/retry"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    /// Verify that a failed resolution can be retried.
    #[tokio::test]
    async fn test_retry_failed_resolution() {
        let app = app();
        let body = r#"{"messageId":"SM1","status":"sent","timestamp":"2024-05-01T10:00:00Z","from":"+15559876543"}"#;
        let first = app
            .clone()
            .oneshot(body_signed(
                "/webhooks/sms",
                "x-sms-signature",
                SMS_SECRET,
                SignatureAlgorithm::HmacSha256,
                body,
            ))
            .await
            .unwrap();
        let id = json_body(first).await["attemptId"]
            .as_str()
            .unwrap()
            .to_string();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/admin/attempts/{id}/retry"))
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let retry = json_body(response).await;
        assert_eq!(retry["success"], false);
        assert_eq!(retry["replay_of"], id);
        assert_eq!(retry["failure_kind"], "resolution");
    }
}

// ============================================================================
// Helpers
// ============================================================================

mod helpers {
    use super::*;

    /// Verify that attempt ids are collapsed in metric paths.
    #[test]
    fn test_normalize_path_for_metrics() {
        let id = AttemptId::new();
        assert_eq!(
            normalize_path_for_metrics(&format!("/admin/attempts/{id}/retry")),
            "/admin/attempts/:id/retry"
        );
        assert_eq!(
            normalize_path_for_metrics("/webhooks/telephony"),
            "/webhooks/telephony"
        );
    }

    /// Verify that the first non-empty signature header wins.
    #[test]
    fn test_first_header_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("x-sms-signature", "".parse().unwrap());
        headers.insert("x-signature", "abc".parse().unwrap());

        assert_eq!(
            first_header(&headers, signature_headers(WebhookSource::SmsDelivery)),
            Some("abc".to_string())
        );
    }

    /// Verify that the client IP comes from the first forwarded hop.
    #[test]
    fn test_client_ip_from_forwarded_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers), Some("203.0.113.9".to_string()));
    }
}
