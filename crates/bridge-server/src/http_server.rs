use std::{convert::Infallible, net::SocketAddr, pin::Pin, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderMap, HeaderValue, Method, StatusCode,
    },
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use docbridge_core::{Bridge, BridgeError, ResultSubmission, SubmitStatus, TaskEnvelope};
use futures_core::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use uuid::Uuid;

use crate::{
    auth::AuthManager,
    transport::{CorsSettings, HttpSettings},
    BridgeServer,
};

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

#[derive(Clone)]
struct HttpState {
    inner: Arc<HttpStateInner>,
}

struct HttpStateInner {
    server: Arc<BridgeServer>,
    auth: Option<AuthManager>,
}

impl HttpState {
    fn new(server: Arc<BridgeServer>, settings: &HttpSettings) -> Self {
        let auth = settings
            .auth
            .as_ref()
            .map(|cfg| AuthManager::new(cfg.tokens.clone()));
        Self {
            inner: Arc::new(HttpStateInner { server, auth }),
        }
    }

    fn ensure_authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), ApiError> {
        match &self.inner.auth {
            Some(auth) if !auth.authorize(headers, query_token) => Err(ApiError::Unauthorized),
            _ => Ok(()),
        }
    }

    fn server(&self) -> &Arc<BridgeServer> {
        &self.inner.server
    }

    fn bridge(&self) -> &Arc<Bridge> {
        self.inner.server.bridge()
    }
}

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    BadRequest(String),
    Internal(anyhow::Error),
}

impl ApiError {
    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::InvalidRequest(_) | BridgeError::InvalidCorrelationId(_) => {
                ApiError::BadRequest(err.to_string())
            }
            BridgeError::Internal(_) => ApiError::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthorized" })),
            )
                .into_response(),
            ApiError::BadRequest(message) => {
                tracing::warn!("rejected malformed request: {message}");
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(err) => {
                tracing::error!("HTTP transport error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PendingQuery {
    #[serde(default)]
    claim: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultQuery {
    correlation_id: Option<String>,
}

pub fn build_router(server: Arc<BridgeServer>, settings: &HttpSettings) -> Router {
    let state = HttpState::new(server, settings);

    let mut router = Router::new()
        .route("/message", post(handle_message))
        .route("/api/tasks/pending", get(pending_tasks))
        .route("/api/tasks/:id/claim", post(claim_task))
        .route("/api/tool-result", post(submit_result).get(lookup_result))
        .route("/api/cleanup", post(cleanup))
        .route("/api/status", get(status))
        .route("/health", get(health));

    if settings.sse_enabled {
        router = router.route("/api/task-stream", get(task_stream));
    }

    router
        .layer(Extension(state))
        .layer(build_cors_layer(settings.cors.as_ref()))
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_transport(server: Arc<BridgeServer>, settings: HttpSettings) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", settings.host, settings.port))?;

    let router = build_router(server, &settings);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind bridge HTTP server to {addr}"))?;
    tracing::info!(sse = settings.sse_enabled, auth = settings.auth.is_some(), "bridge HTTP server listening on {addr}");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP transport encountered an unrecoverable error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn handle_message(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;

    let result = state
        .server()
        .handle_jsonrpc(payload)
        .await
        .map_err(ApiError::internal)?;

    Ok(match result {
        Some(value) => (StatusCode::OK, Json(value)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

fn task_event(task: &TaskEnvelope) -> Option<Result<Event, Infallible>> {
    match serde_json::to_string(task) {
        Ok(data) => Some(Ok(Event::default().event("task").data(data))),
        Err(err) => {
            tracing::error!(correlation_id = %task.correlation_id, "failed to serialize task event: {err}");
            None
        }
    }
}

/// Push channel: `connected`, then the pending backlog, then live tasks, with
/// heartbeat comments in between.
async fn task_stream(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Sse<EventStream>, ApiError> {
    state.ensure_authorized(&headers, query.token.as_deref())?;

    let bridge = state.bridge();
    // subscribe first so nothing dispatched while the backlog is read gets lost
    let receiver = bridge.hub().subscribe();
    let backlog: Vec<_> = bridge
        .hub()
        .list_pending()
        .iter()
        .filter_map(task_event)
        .collect();
    tracing::info!(backlog = backlog.len(), "task stream opened");

    let config = bridge.config();
    let heartbeat = config.heartbeat_interval();
    let connected = Event::default().event("connected").data(
        json!({
            "heartbeatSecs": heartbeat.as_secs(),
            "pollIntervalMs": config.poll_interval().as_millis() as u64,
            "pushReconnectAttempts": config.push_reconnect_attempts,
        })
        .to_string(),
    );

    let live = BroadcastStream::new(receiver).filter_map(|event| match event {
        Ok(task) => task_event(&task),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("task stream subscriber lagged by {skipped} tasks");
            None
        }
    });

    let stream = tokio_stream::once(Ok::<Event, Infallible>(connected))
        .chain(tokio_stream::iter(backlog))
        .chain(live);

    let keep_alive = KeepAlive::new().interval(heartbeat).text("heartbeat");
    let boxed: EventStream = Box::pin(stream);
    Ok(Sse::new(boxed).keep_alive(keep_alive))
}

async fn pending_tasks(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_authorized(&headers, None)?;

    let hub = state.bridge().hub();
    let tasks = if query.claim {
        hub.claim_pending()
    } else {
        hub.list_pending()
    };
    Ok(Json(json!({ "tasks": tasks })))
}

async fn claim_task(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;

    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::from(BridgeError::InvalidCorrelationId(id.clone())))?;
    Ok(match state.bridge().hub().claim(&id) {
        Some(task) => (StatusCode::OK, Json(json!({ "status": "claimed", "task": task }))).into_response(),
        None => (StatusCode::CONFLICT, Json(json!({ "status": "unavailable" }))).into_response(),
    })
}

async fn submit_result(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    payload: Result<Json<ResultSubmission>, JsonRejection>,
) -> Result<Response, ApiError> {
    state.ensure_authorized(&headers, None)?;

    let Json(submission) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let status = state.bridge().submit(submission)?;
    let code = match status {
        SubmitStatus::UnknownCorrelationId => StatusCode::NOT_FOUND,
        SubmitStatus::Accepted | SubmitStatus::Stale => StatusCode::OK,
    };
    Ok((code, Json(json!({ "status": status.as_str() }))).into_response())
}

/// Reads a recorded result from the backup cache without consuming it.
async fn lookup_result(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
    Query(query): Query<ResultQuery>,
) -> Result<Json<Value>, ApiError> {
    state.ensure_authorized(&headers, None)?;

    let raw = query
        .correlation_id
        .ok_or_else(|| ApiError::BadRequest("correlationId is required".into()))?;
    let id = Uuid::parse_str(&raw).map_err(|_| ApiError::from(BridgeError::InvalidCorrelationId(raw)))?;

    Ok(Json(match state.bridge().bus().get(&id) {
        Some(result) => json!({ "found": true, "result": result }),
        None => json!({ "found": false }),
    }))
}

async fn cleanup(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.ensure_authorized(&headers, None)?;

    let report = state.bridge().sweep();
    Ok(Json(json!({ "removed": report })))
}

async fn status(
    Extension(state): Extension<HttpState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.ensure_authorized(&headers, None)?;
    let status = serde_json::to_value(state.bridge().status()).map_err(ApiError::internal)?;
    Ok(Json(status))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn build_cors_layer(config: Option<&CorsSettings>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = config
        .map(|cors| {
            cors.allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    if origins.is_empty() {
        layer
    } else {
        layer.allow_origin(AllowOrigin::list(origins))
    }
}
