//! HTTP API
//!
//! - `POST /add`: count one event, body `{"type": "...", "app": "..."}`
//! - `GET /metrics`: Prometheus scrape of the counter mirror and request metrics
//! - `GET /health`, `/health/live`, `/health/ready`

use crate::common::metrics::PROMETHEUS_CONTENT_TYPE;
use crate::common::tracing_middleware::{request_tracing_middleware, RequestTracing};
use crate::common::{Error, MetricsRegistry, Result};
use crate::store::CounterStore;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, Response as HttpResponse, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::catch_panic::{CatchPanicLayer, ResponseForPanic};
use tower_http::limit::RequestBodyLimitLayer;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub counters: Arc<CounterStore>,
    pub metrics: Arc<MetricsRegistry>,
    /// Set once reconciliation is done, cleared when shutdown starts
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(counters: CounterStore) -> Self {
        Self {
            counters: Arc::new(counters),
            metrics: Arc::new(MetricsRegistry::new()),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

/// Body of `POST /add`
#[derive(Debug, Clone, Deserialize)]
pub struct AddRequest {
    #[serde(rename = "type", default)]
    pub counter_type: String,
    #[serde(default)]
    pub app: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddResponse {
    pub app: String,
    #[serde(rename = "type")]
    pub counter_type: String,
    pub total: u64,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Logs the panic and answers 500 instead of dropping the connection
#[derive(Clone)]
struct PanicReporter {
    metrics: Arc<MetricsRegistry>,
}

impl ResponseForPanic for PanicReporter {
    type ResponseBody = Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> HttpResponse<Body> {
        let detail = if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = err.downcast_ref::<&str>() {
            s.to_string()
        } else {
            "unknown panic payload".to_string()
        };
        self.metrics.panics.inc();
        tracing::error!(panic = %detail, "Handler panicked");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    }
}

/// Build the router. Request spans are parented on the span current at this call.
pub fn create_router(state: AppState, max_body_bytes: usize) -> Router {
    let panic_reporter = PanicReporter {
        metrics: state.metrics.clone(),
    };
    let tracing_state = RequestTracing::new(state.metrics.clone());

    Router::new()
        .route("/add", post(add))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_reporter))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(axum::middleware::from_fn_with_state(
            tracing_state,
            request_tracing_middleware,
        ))
}

/// Count one event.
///
/// The body is decoded regardless of `Content-Type`. Storage work runs on
/// the blocking pool; errors are always reported to the caller.
async fn add(State(state): State<AppState>, body: Bytes) -> Response {
    let req: AddRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode add request");
            return error_response(StatusCode::BAD_REQUEST, format!("invalid request body: {}", e));
        }
    };

    match increment(&state, req.app, req.counter_type).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            if e.is_fatal() {
                tracing::error!(error = %e, "Refusing increment on corrupted counter");
            }
            error_response(e.to_http_status(), e.to_string())
        }
    }
}

async fn increment(state: &AppState, app: String, counter_type: String) -> Result<AddResponse> {
    let counters = state.counters.clone();
    let span = tracing::Span::current();
    let joined = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        let total = counters.increment(&app, &counter_type)?;
        Ok(AddResponse {
            app,
            counter_type,
            total,
        })
    })
    .await;

    match joined {
        Ok(result) => result,
        Err(e) => {
            if e.is_panic() {
                state.metrics.panics.inc();
            }
            Err(Error::Internal(format!("increment task failed: {}", e)))
        }
    }
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut out = String::new();
    state.counters.mirror().render_prometheus(&mut out);
    state.metrics.render_prometheus(&mut out);
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], out)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "ready": state.is_ready(),
        "backend": state.counters.backend().name(),
        "counters": state.counters.mirror().len(),
        "uptime_seconds": state.metrics.uptime_seconds(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_live() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}

async fn health_ready(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, Json(json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready" })),
        )
    }
}
