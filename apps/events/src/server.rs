use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    config::Config,
    ledger::WebhookLedger,
    rate_limit::{FixedWindowLimiter, RateLimitUsage},
    registry::ConnectionRegistry,
    retry::{RECENT_FAILURE_WINDOW, RetryCoordinator, RetryError},
    router::EventRouter,
    signature::verify_signature,
    socket_auth::SocketAuthorizer,
    types::{ClientFrame, Notification, ProcessingResult, ServerFrame, WebhookRecord},
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    router: Arc<EventRouter>,
    retries: Arc<RetryCoordinator>,
    registry: Arc<ConnectionRegistry>,
    ledger: Arc<dyn WebhookLedger>,
    socket_auth: Arc<SocketAuthorizer>,
    webhook_limiter: Arc<FixedWindowLimiter>,
    api_limiter: Arc<FixedWindowLimiter>,
    admin_limiter: Arc<FixedWindowLimiter>,
    started_at: DateTime<Utc>,
}

impl AppState {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        router: Arc<EventRouter>,
        retries: Arc<RetryCoordinator>,
        registry: Arc<ConnectionRegistry>,
        ledger: Arc<dyn WebhookLedger>,
        socket_auth: Arc<SocketAuthorizer>,
        webhook_limiter: Arc<FixedWindowLimiter>,
        api_limiter: Arc<FixedWindowLimiter>,
        admin_limiter: Arc<FixedWindowLimiter>,
    ) -> Self {
        Self {
            config,
            router,
            retries,
            registry,
            ledger,
            socket_auth,
            webhook_limiter,
            api_limiter,
            admin_limiter,
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    #[must_use]
    pub fn rate_limiters(&self) -> Vec<Arc<FixedWindowLimiter>> {
        vec![
            self.webhook_limiter.clone(),
            self.api_limiter.clone(),
            self.admin_limiter.clone(),
        ]
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn rate_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.config.rate_sweep_interval_ms)
    }

    fn secret_for(&self, source: &str) -> Option<&str> {
        self.config
            .webhook_secrets
            .get(source)
            .or(self.config.webhook_default_secret.as_ref())
            .map(String::as_str)
    }

    fn limiter_by_name(&self, name: &str) -> Option<&Arc<FixedWindowLimiter>> {
        match name {
            "webhook" => Some(&self.webhook_limiter),
            "api" => Some(&self.api_limiter),
            "admin" => Some(&self.admin_limiter),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    uptime_seconds: i64,
    ledger_driver: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    ledger_driver: &'static str,
    connected_recipients: usize,
    live_connections: usize,
}

#[derive(Debug, Deserialize)]
struct WebhookDeliveryBody {
    event_type: String,
    #[serde(default)]
    payload: Value,
    id: Option<String>,
}

#[derive(Debug, Serialize)]
struct FailuresResponse {
    failures: Vec<WebhookRecord>,
}

#[derive(Debug, Deserialize)]
struct FailuresQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SendNotificationBody {
    recipient_id: String,
    #[serde(default)]
    kind: Option<String>,
    title: String,
    body: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
struct SendNotificationResponse {
    recipient_id: String,
    delivered: usize,
}

#[derive(Debug, Deserialize)]
struct LimiterQuery {
    limiter: Option<String>,
}

#[derive(Debug, Serialize)]
struct RateLimitUsageResponse {
    identity: String,
    limiter: String,
    usage: RateLimitUsage,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/v1/webhooks/:source", post(ingest_webhook))
        .route("/v1/notifications/ws", get(get_notifications_ws))
        .route("/internal/v1/webhooks/failures", get(list_failed_webhooks))
        .route("/internal/v1/webhooks/:id/retry", post(retry_webhook))
        .route(
            "/internal/v1/notifications/send",
            post(send_notification),
        )
        .route(
            "/internal/v1/rate-limits/:identity",
            get(get_rate_limit_usage).delete(reset_rate_limit),
        )
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        uptime_seconds,
        ledger_driver: state.ledger.driver_name(),
    })
}

async fn readiness(State(state): State<AppState>) -> Json<ReadinessResponse> {
    let (connected_recipients, live_connections) = state.registry.connection_counts().await;
    Json(ReadinessResponse {
        status: "ready",
        ledger_driver: state.ledger.driver_name(),
        connected_recipients,
        live_connections,
    })
}

async fn ingest_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ProcessingResult>, ApiError> {
    let source = source.trim().to_ascii_lowercase();
    let Some(secret) = state.secret_for(&source) else {
        tracing::warn!(source = %source, "webhook from unconfigured source rejected");
        return Err(ApiError::Unauthorized("unknown_source".to_string()));
    };

    let presented = headers
        .get("x-webhook-signature")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented.trim().is_empty() {
        return Err(ApiError::Unauthorized("missing_signature".to_string()));
    }
    if !verify_signature(&body, presented, secret) {
        tracing::warn!(source = %source, "webhook signature verification failed");
        return Err(ApiError::Unauthorized("invalid_signature".to_string()));
    }

    let delivery: WebhookDeliveryBody = serde_json::from_slice(&body)
        .map_err(|error| ApiError::InvalidRequest(format!("invalid webhook body: {error}")))?;
    if delivery.event_type.trim().is_empty() {
        return Err(ApiError::InvalidRequest("event_type is required".to_string()));
    }

    let source_ip = client_ip(&headers);
    let result = state
        .router
        .process(
            &delivery.event_type,
            delivery.payload,
            &source,
            delivery.id.as_deref(),
            source_ip.as_deref(),
        )
        .await;

    if result.rate_limited {
        return Err(ApiError::RateLimited {
            retry_after_seconds: result.retry_after_seconds.unwrap_or(1),
            reason_code: "webhook_ingest_rate_limited".to_string(),
        });
    }
    // 200 even on handler failure; the success flag travels in the body.
    Ok(Json(result))
}

async fn retry_webhook(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ProcessingResult>, ApiError> {
    let actor = headers
        .get("x-admin-actor")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("admin");
    let decision = state.admin_limiter.check(actor).await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds.unwrap_or(1),
            reason_code: "admin_rate_limited".to_string(),
        });
    }

    let result = state
        .retries
        .retry(&id)
        .await
        .map_err(ApiError::from_retry)?;
    Ok(Json(result))
}

async fn list_failed_webhooks(
    State(state): State<AppState>,
    Query(query): Query<FailuresQuery>,
) -> Result<Json<FailuresResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(RECENT_FAILURE_WINDOW)
        .clamp(1, RECENT_FAILURE_WINDOW);
    let failures = state
        .ledger
        .recent_failures(limit)
        .await
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    Ok(Json(FailuresResponse { failures }))
}

async fn send_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SendNotificationBody>,
) -> Result<Json<SendNotificationResponse>, ApiError> {
    let caller = headers
        .get("x-caller-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("internal");
    let decision = state.api_limiter.check(caller).await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds.unwrap_or(1),
            reason_code: "api_rate_limited".to_string(),
        });
    }

    let recipient_id = body.recipient_id.trim().to_ascii_lowercase();
    if recipient_id.is_empty() {
        return Err(ApiError::InvalidRequest(
            "recipient_id is required".to_string(),
        ));
    }
    let notification = Notification::new(
        &recipient_id,
        body.kind.as_deref().unwrap_or("system"),
        body.title,
        body.body,
        body.data.unwrap_or(Value::Null),
    );
    let delivered = state
        .registry
        .send_to_recipient(&recipient_id, &ServerFrame::Notification(notification))
        .await;
    Ok(Json(SendNotificationResponse {
        recipient_id,
        delivered,
    }))
}

async fn get_rate_limit_usage(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(query): Query<LimiterQuery>,
) -> Result<Json<RateLimitUsageResponse>, ApiError> {
    let name = query.limiter.unwrap_or_else(|| "webhook".to_string());
    let limiter = state
        .limiter_by_name(&name)
        .ok_or_else(|| ApiError::InvalidRequest(format!("unknown limiter {name}")))?;
    let usage = limiter.usage(&identity).await;
    Ok(Json(RateLimitUsageResponse {
        identity,
        limiter: name,
        usage,
    }))
}

async fn reset_rate_limit(
    State(state): State<AppState>,
    Path(identity): Path<String>,
    Query(query): Query<LimiterQuery>,
) -> Result<StatusCode, ApiError> {
    let name = query.limiter.unwrap_or_else(|| "webhook".to_string());
    let limiter = state
        .limiter_by_name(&name)
        .ok_or_else(|| ApiError::InvalidRequest(format!("unknown limiter {name}")))?;
    limiter.reset(&identity).await;
    tracing::info!(identity = %identity, limiter = %name, "rate limit window reset");
    Ok(StatusCode::NO_CONTENT)
}

async fn get_notifications_ws(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let peer = client_ip(&headers).unwrap_or_else(|| "unknown".to_string());
    let decision = state.api_limiter.check(&format!("ws_{peer}")).await;
    if !decision.allowed {
        return Err(ApiError::RateLimited {
            retry_after_seconds: decision.retry_after_seconds.unwrap_or(1),
            reason_code: "socket_connect_rate_limited".to_string(),
        });
    }
    Ok(ws.on_upgrade(move |socket| notification_socket(state, socket)))
}

/// Connection state machine: Connected (unauthenticated) until a valid
/// `authenticate` frame arrives, then Authenticated and tracked by the
/// registry until close, error, or heartbeat eviction.
async fn notification_socket(state: AppState, mut socket: WebSocket) {
    if send_frame(&mut socket, &ServerFrame::Connected).await.is_err() {
        return;
    }

    // Unauthenticated sockets are transient: one heartbeat interval to
    // present a token, and they are never tracked by the registry.
    let handshake_deadline = tokio::time::sleep(state.heartbeat_interval());
    tokio::pin!(handshake_deadline);

    let recipient_id = loop {
        tokio::select! {
            () = &mut handshake_deadline => {
                let _ = send_frame(&mut socket, &ServerFrame::Error {
                    error: "authentication_timeout".to_string(),
                }).await;
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Authenticate { token }) => {
                        match state.socket_auth.authenticate(&token) {
                            Ok(recipient_id) => break recipient_id,
                            Err(error) => {
                                tracing::warn!(
                                    reason_code = error.code(),
                                    "socket authentication rejected"
                                );
                                let _ = send_frame(&mut socket, &ServerFrame::Error {
                                    error: error.code().to_string(),
                                }).await;
                                let _ = socket.send(Message::Close(None)).await;
                                return;
                            }
                        }
                    }
                    _ => {
                        let _ = send_frame(&mut socket, &ServerFrame::Error {
                            error: "authentication_required".to_string(),
                        }).await;
                        let _ = socket.send(Message::Close(None)).await;
                        return;
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(_)) => return,
            }
        }
    };

    if send_frame(
        &mut socket,
        &ServerFrame::Authenticated {
            recipient_id: recipient_id.clone(),
        },
    )
    .await
    .is_err()
    {
        return;
    }

    let (sender, mut outbound) = mpsc::unbounded_channel();
    let entry = state.registry.register(&recipient_id, sender).await;
    tracing::info!(
        recipient = %recipient_id,
        connection = entry.id(),
        "notification socket authenticated"
    );

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(message) => {
                    let closing = matches!(message, Message::Close(_));
                    if socket.send(message).await.is_err() || closing {
                        break;
                    }
                }
                None => break,
            },
            inbound = socket.next() => match inbound {
                Some(Ok(Message::Pong(_))) => entry.mark_alive(),
                Some(Ok(Message::Ping(payload))) => {
                    entry.mark_alive();
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(ClientFrame::Ping) => {
                            entry.mark_alive();
                            let _ = send_frame(&mut socket, &ServerFrame::Pong).await;
                        }
                        // Re-authentication of a live socket is a no-op.
                        Ok(ClientFrame::Authenticate { .. }) | Err(_) => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    }

    state.registry.deregister(&entry).await;
    tracing::debug!(
        recipient = %recipient_id,
        connection = entry.id(),
        "notification socket closed"
    );
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(payload) => socket.send(Message::Text(payload)).await,
        Err(_) => Ok(()),
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")?
        .to_str()
        .ok()?
        .split(',')
        .next()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug)]
enum ApiError {
    NotFound,
    Unauthorized(String),
    Conflict(String),
    RateLimited {
        retry_after_seconds: u64,
        reason_code: String,
    },
    InvalidRequest(String),
    Internal(String),
}

impl ApiError {
    fn from_retry(error: RetryError) -> Self {
        match error {
            RetryError::NotFound(_) => Self::NotFound,
            RetryError::Exhausted { .. } => Self::Conflict(error.to_string()),
            RetryError::Ledger(reason) => Self::Internal(reason.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        match self {
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "not_found",
                })),
            )
                .into_response(),
            Self::Unauthorized(reason_code) => (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({
                    "error": "unauthorized",
                    "message": "webhook authentication failed",
                    "reason_code": reason_code,
                })),
            )
                .into_response(),
            Self::Conflict(message) => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({
                    "error": "conflict",
                    "message": message,
                })),
            )
                .into_response(),
            Self::RateLimited {
                retry_after_seconds,
                reason_code,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": "rate_limited",
                        "reason_code": reason_code,
                        "retry_after_seconds": retry_after_seconds,
                    })),
                )
                    .into_response();
                if let Ok(value) = header::HeaderValue::from_str(&retry_after_seconds.to_string())
                {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }
            Self::InvalidRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "message": message,
                })),
            )
                .into_response(),
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal",
                    "message": message,
                })),
            )
                .into_response(),
        }
    }
}
