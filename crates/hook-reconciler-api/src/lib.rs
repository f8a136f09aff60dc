//! # Hook-Reconciler HTTP Service
//!
//! HTTP layer in front of the webhook pipeline.
//!
//! This crate provides:
//! - One signed webhook route per provider family
//! - Health, readiness and Prometheus metrics endpoints
//! - Admin API to inspect and replay webhook attempts
//!
//! Webhook routes answer `401` for authentication failures, `400` for schema
//! rejections and `413` for oversized bodies. Everything that gets past those
//! checks is answered with `200` and a `{success, message, ...}` body.

pub mod config;
pub mod errors;
pub mod metrics;
pub mod responses;

pub use config::{
    LoggingConfig, ProviderConfig, ProvidersConfig, SecretSource, ServerConfig, ServiceConfig,
    WebhookConfig,
};
pub use errors::{AdminError, ConfigError, ServiceError, WebhookHandlerError};
pub use metrics::ServiceMetrics;
pub use responses::{
    AttemptDetailResponse, AttemptListParams, AttemptListResponse, HealthResponse,
    ReadinessResponse, RetryResponse, WebhookResponse,
};

use axum::{
    extract::{rejection::BytesRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    middleware,
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use hook_reconciler_core::{
    AttemptId, AttemptQuery, AttemptStatus, AuditError, CorrelationId, Pagination, PipelineError,
    PipelineOutcome, ResolutionHints, TenantId, Timestamp, Ulid, VerificationContext,
    WebhookPipeline, WebhookRequest, WebhookSource,
};
use std::{future::IntoFuture, net::SocketAddr, sync::Arc, time::Instant};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Header used to correlate a request across logs and services
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration for the service
    pub config: Arc<ServiceConfig>,

    /// The staged webhook pipeline
    pub pipeline: WebhookPipeline,

    /// Metrics collector for observability
    pub metrics: Arc<ServiceMetrics>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ServiceConfig,
        pipeline: WebhookPipeline,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            pipeline,
            metrics,
        }
    }
}

// ============================================================================
// HTTP Server
// ============================================================================

/// Create HTTP router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let webhook_routes = Router::new()
        .route("/webhooks/telephony", post(handle_telephony_webhook))
        .route("/webhooks/calendar", post(handle_calendar_webhook))
        .route("/webhooks/sms", post(handle_sms_webhook))
        .route("/webhooks/reviews", post(handle_review_webhook))
        .layer(DefaultBodyLimit::max(state.config.server.max_body_size));

    let health_routes = Router::new()
        .route("/health", get(handle_health_check))
        .route("/ready", get(handle_readiness_check));

    let observability_routes = Router::new().route("/metrics", get(metrics_endpoint));

    let admin_routes = Router::new()
        .route("/admin/attempts", get(list_attempts))
        .route("/admin/attempts/{attempt_id}", get(get_attempt))
        .route("/admin/attempts/{attempt_id}/retry", post(retry_attempt));

    Router::new()
        .merge(webhook_routes)
        .merge(health_routes)
        .merge(observability_routes)
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(correlation_id_middleware))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    metrics_middleware,
                ))
                .into_inner(),
        )
        .with_state(state)
}

/// Start HTTP server
pub async fn start_server(
    config: ServiceConfig,
    pipeline: WebhookPipeline,
) -> Result<(), ServiceError> {
    let metrics = ServiceMetrics::new()?;

    let address = format!("{}:{}", config.server.host, config.server.port);
    let addr: SocketAddr = address.parse().map_err(|_| ConfigError::Invalid {
        message: format!("'{address}' is not a valid socket address"),
    })?;
    let shutdown_timeout =
        std::time::Duration::from_secs(config.server.shutdown_timeout_seconds);

    let state = AppState::new(config, pipeline, metrics);
    let app = create_router(state);

    let listener =
        tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ServiceError::BindFailed {
                address: addr.to_string(),
                message: e.to_string(),
            })?;

    info!(address = %addr, "HTTP server listening");

    let shutdown_signal = async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C signal handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM signal handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!(signal = "SIGINT", "Initiating graceful shutdown"),
            _ = terminate => info!(signal = "SIGTERM", "Initiating graceful shutdown"),
        }
    };

    // In-flight deliveries get `shutdown_timeout` to finish and close their attempts
    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal.await;
        let _ = signalled_tx.send(());
    });
    let deadline = async move {
        if signalled_rx.await.is_ok() {
            tokio::time::sleep(shutdown_timeout).await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = serve.into_future() => {
            result.map_err(|e| ServiceError::ServerFailed {
                message: e.to_string(),
            })?;
        }
        _ = deadline => {
            warn!(
                timeout_seconds = shutdown_timeout.as_secs(),
                "Graceful shutdown timed out; abandoning in-flight requests"
            );
        }
    }

    info!("HTTP server shutdown complete");
    Ok(())
}

// ============================================================================
// Webhook Handlers
// ============================================================================

/// Voice provider call status callbacks (form-encoded, URL-signed)
#[instrument(skip_all, fields(source = "telephony"))]
async fn handle_telephony_webhook(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let body = read_body(&state, WebhookSource::Telephony, body)?;
    let url = signed_url(&state.config.webhooks, &headers, &uri);

    let request = WebhookRequest::new(WebhookSource::Telephony, body)
        .with_context(VerificationContext::with_url(url));
    dispatch(&state, request, &headers).await
}

/// Calendar push notifications (JSON, timestamp-signed)
#[instrument(skip_all, fields(source = "calendar"))]
async fn handle_calendar_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let body = read_body(&state, WebhookSource::Calendar, body)?;

    let context = match header_value(&headers, "x-calendar-timestamp") {
        Some(timestamp) => VerificationContext::with_timestamp(timestamp),
        None => VerificationContext::default(),
    };
    let hints = ResolutionHints {
        tenant_token: header_value(&headers, "x-calendar-channel-token"),
    };

    let request = WebhookRequest::new(WebhookSource::Calendar, body)
        .with_context(context)
        .with_hints(hints);
    dispatch(&state, request, &headers).await
}

/// SMS delivery receipts (JSON, body-signed)
#[instrument(skip_all, fields(source = "sms-delivery"))]
async fn handle_sms_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let body = read_body(&state, WebhookSource::SmsDelivery, body)?;
    let request = WebhookRequest::new(WebhookSource::SmsDelivery, body);
    dispatch(&state, request, &headers).await
}

/// Review platform notifications (JSON, body-signed)
#[instrument(skip_all, fields(source = "review-platform"))]
async fn handle_review_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let body = read_body(&state, WebhookSource::ReviewPlatform, body)?;
    let request = WebhookRequest::new(WebhookSource::ReviewPlatform, body);
    dispatch(&state, request, &headers).await
}

/// Attach signature and provenance, run the pipeline, shape the response.
async fn dispatch(
    state: &AppState,
    request: WebhookRequest,
    headers: &HeaderMap,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let source = request.source;
    let mut request = request.with_provenance(
        client_ip(headers),
        header_value(headers, header::USER_AGENT.as_str()),
    );
    request.signature = first_header(headers, signature_headers(source));

    let started = Instant::now();
    let outcome = state.pipeline.process(request).await;
    state.metrics.observe_webhook(&outcome, started.elapsed());

    webhook_response(outcome)
}

fn webhook_response(
    outcome: PipelineOutcome,
) -> Result<Json<WebhookResponse>, WebhookHandlerError> {
    let PipelineOutcome {
        source,
        attempt_id,
        result,
        ..
    } = outcome;

    match result {
        Ok(reconciled) => Ok(Json(WebhookResponse::reconciled(attempt_id, &reconciled))),
        Err(PipelineError::Authentication { .. }) => {
            Err(WebhookHandlerError::Unauthorized { attempt_id })
        }
        Err(PipelineError::Validation(e)) => Err(WebhookHandlerError::InvalidPayload {
            attempt_id,
            message: e.to_string(),
            field: Some(e.field),
        }),
        Err(e) => Ok(Json(WebhookResponse::business_failure(
            source, attempt_id, &e,
        ))),
    }
}

fn read_body(
    state: &AppState,
    source: WebhookSource,
    body: Result<Bytes, BytesRejection>,
) -> Result<Bytes, WebhookHandlerError> {
    match body {
        Ok(body) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            state.metrics.observe_oversized(source);
            Err(WebhookHandlerError::PayloadTooLarge {
                max_size: state.config.server.max_body_size,
            })
        }
        Err(rejection) => Err(WebhookHandlerError::UnreadableBody {
            message: rejection.body_text(),
        }),
    }
}

/// Header names carrying the signature, in precedence order
fn signature_headers(source: WebhookSource) -> &'static [&'static str] {
    match source {
        WebhookSource::Telephony => &["x-telephony-signature"],
        WebhookSource::Calendar => &["x-calendar-signature"],
        WebhookSource::SmsDelivery => &["x-sms-signature", "x-signature"],
        WebhookSource::ReviewPlatform => &["x-review-signature", "x-signature"],
    }
}

/// First header in `names` with a non-empty value
fn first_header(headers: &HeaderMap, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| header_value(headers, name))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_value(headers, "x-forwarded-for")
        .and_then(|chain| {
            chain
                .split(',')
                .next()
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
        })
        .or_else(|| header_value(headers, "x-real-ip"))
}

/// URL the telephony provider signed.
///
/// Uses `webhooks.public_base_url` when configured, otherwise rebuilds the
/// URL from forwarding headers and `Host`.
fn signed_url(webhooks: &WebhookConfig, headers: &HeaderMap, uri: &Uri) -> String {
    let path = uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or_else(|| uri.path());

    if let Some(base) = &webhooks.public_base_url {
        return format!("{}{}", base.trim_end_matches('/'), path);
    }

    let scheme = header_value(headers, "x-forwarded-proto").unwrap_or_else(|| "https".to_string());
    let host = header_value(headers, "x-forwarded-host")
        .or_else(|| header_value(headers, header::HOST.as_str()))
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "localhost".to_string());

    format!("{scheme}://{host}{path}")
}

// ============================================================================
// Health Check Handlers
// ============================================================================

/// Basic liveness check
#[instrument(skip_all)]
async fn handle_health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Timestamp::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ready once at least one provider can be authenticated
#[instrument(skip_all)]
async fn handle_readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let configured = &state.pipeline.config().providers;
    let providers: Vec<WebhookSource> = WebhookSource::ALL
        .into_iter()
        .filter(|source| configured.contains_key(source))
        .collect();

    let ready = !providers.is_empty();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            timestamp: Timestamp::now(),
            providers,
        }),
    )
}

// ============================================================================
// Observability Handlers
// ============================================================================

/// Prometheus metrics endpoint
#[instrument(skip_all)]
async fn metrics_endpoint(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.render().map_err(|e| {
        error!(error = %e, "Failed to encode metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

// ============================================================================
// Admin Handlers
// ============================================================================

#[instrument(skip(state))]
async fn list_attempts(
    State(state): State<AppState>,
    Query(params): Query<AttemptListParams>,
) -> Result<Json<AttemptListResponse>, AdminError> {
    let query = attempt_query(&params)?;
    let defaults = Pagination::default();
    let pagination = Pagination::new(
        params.page.unwrap_or(defaults.page),
        params.per_page.unwrap_or(defaults.per_page),
    );

    let page = state
        .pipeline
        .audit_log()
        .query(&query, pagination)
        .await
        .map_err(admin_audit_error)?;

    Ok(Json(page.into()))
}

#[instrument(skip(state))]
async fn get_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<AttemptDetailResponse>, AdminError> {
    let attempt_id = parse_attempt_id(&attempt_id)?;
    let attempt = state
        .pipeline
        .audit_log()
        .get(&attempt_id)
        .await
        .map_err(admin_audit_error)?;

    Ok(Json(AttemptDetailResponse { attempt }))
}

/// Re-run a failed attempt from its stored payload
#[instrument(skip(state))]
async fn retry_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<String>,
) -> Result<Json<RetryResponse>, AdminError> {
    let original = parse_attempt_id(&attempt_id)?;

    let started = Instant::now();
    let outcome = match state.pipeline.replay(&original).await {
        Ok(outcome) => outcome,
        Err(e) => {
            state.metrics.observe_replay("refused");
            return Err(match e {
                PipelineError::AttemptNotFound { attempt_id } => AdminError::AttemptNotFound {
                    attempt_id: attempt_id.to_string(),
                },
                PipelineError::NotReplayable { .. } => AdminError::NotReplayable {
                    message: e.to_string(),
                },
                other => AdminError::Unavailable {
                    message: other.to_string(),
                },
            });
        }
    };
    state.metrics.observe_webhook(&outcome, started.elapsed());

    let failure_kind = outcome.failure_kind();
    state
        .metrics
        .observe_replay(failure_kind.map_or("completed", |kind| kind.as_str()));

    let message = match &outcome.result {
        Ok(_) => "Attempt replayed successfully".to_string(),
        Err(e) => {
            warn!(attempt_id = %original, error = %e, "Replay failed");
            e.to_string()
        }
    };

    Ok(Json(RetryResponse {
        success: outcome.is_success(),
        message,
        replay_of: original,
        attempt_id: outcome.attempt_id,
        failure_kind: failure_kind.map(|kind| kind.as_str().to_string()),
    }))
}

fn parse_attempt_id(raw: &str) -> Result<AttemptId, AdminError> {
    raw.parse().map_err(|_| AdminError::InvalidParameter {
        name: "attempt_id".to_string(),
        message: format!("'{raw}' is not a valid attempt id"),
    })
}

fn attempt_query(params: &AttemptListParams) -> Result<AttemptQuery, AdminError> {
    fn invalid(name: &str, e: impl std::fmt::Display) -> AdminError {
        AdminError::InvalidParameter {
            name: name.to_string(),
            message: e.to_string(),
        }
    }

    Ok(AttemptQuery {
        source: params
            .source
            .as_deref()
            .map(str::parse::<WebhookSource>)
            .transpose()
            .map_err(|e| invalid("source", e))?,
        status: params
            .status
            .as_deref()
            .map(str::parse::<AttemptStatus>)
            .transpose()
            .map_err(|e| invalid("status", e))?,
        tenant_id: params
            .tenant
            .as_deref()
            .map(TenantId::new)
            .transpose()
            .map_err(|e| invalid("tenant", e))?,
        from: params
            .from
            .as_deref()
            .map(Timestamp::from_rfc3339)
            .transpose()
            .map_err(|e| invalid("from", e))?,
        to: params
            .to
            .as_deref()
            .map(Timestamp::from_rfc3339)
            .transpose()
            .map_err(|e| invalid("to", e))?,
    })
}

fn admin_audit_error(e: AuditError) -> AdminError {
    match e {
        AuditError::NotFound { attempt_id } => AdminError::AttemptNotFound {
            attempt_id: attempt_id.to_string(),
        },
        other => AdminError::Unavailable {
            message: other.to_string(),
        },
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Correlation ID tracking and request logging
///
/// Reuses an inbound `x-correlation-id` or generates one, records it on the
/// span, and echoes it on the response.
#[instrument(skip(request, next), fields(
    method = %request.method(),
    uri = %request.uri(),
    correlation_id
))]
async fn correlation_id_middleware(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let correlation_id = CorrelationId::from_inbound(
        request
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
    );

    tracing::Span::current().record("correlation_id", correlation_id.as_str());
    request.extensions_mut().insert(correlation_id.clone());

    let mut response = next.run(request).await;
    let duration = start.elapsed();

    if let Ok(header_value) = header::HeaderValue::from_str(correlation_id.as_str()) {
        response
            .headers_mut()
            .insert(CORRELATION_ID_HEADER, header_value);
    }

    let status = response.status();
    if status.is_server_error() {
        error!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        warn!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed with client error"
        );
    } else {
        info!(
            correlation_id = %correlation_id,
            method = %method,
            uri = %uri,
            status = %status,
            duration_ms = %duration.as_millis(),
            "Request completed successfully"
        );
    }

    response
}

/// Count every request by method, normalized path and status.
async fn metrics_middleware(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = request.method().to_string();
    let path = normalize_path_for_metrics(request.uri().path());

    let response = next.run(request).await;
    state
        .metrics
        .observe_http(&method, &path, response.status().as_u16());

    response
}

/// Normalize path for metrics to avoid cardinality explosion
///
/// Converts `/admin/attempts/01HV.../retry` to `/admin/attempts/:id/retry`.
fn normalize_path_for_metrics(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<Ulid>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
