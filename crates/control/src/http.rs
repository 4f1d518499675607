use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::dispatch::ExecutionLimits;
use crate::error::DispatchError;
use crate::pools::PoolSet;
use crate::protocol::{FileRef, JobMessage, Language};
use crate::stats::PoolStatus;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub pools: Arc<PoolSet>,
    pub limits: ExecutionLimits,
    pub max_code_bytes: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct HttpLimits {
    pub max_inflight: usize,
    pub request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RunRequest {
    #[serde(default)]
    code: String,
    #[serde(default)]
    language: String,
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    success: bool,
    error: String,
    output: String,
    version: String,
    files: Vec<FileRef>,
    /// Milliseconds from publish to reply.
    duration: u64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState, limits: HttpLimits) -> Router {
    // Room for the code itself plus JSON escaping and the other fields.
    let body_limit = state.max_code_bytes.saturating_mul(2).max(4 * 1024);
    Router::new()
        .route("/health", get(healthcheck).head(healthcheck))
        .route("/pools", get(pools_handler))
        .route(
            "/run",
            post(run_handler).layer(
                ServiceBuilder::new()
                    .layer(DefaultBodyLimit::max(body_limit))
                    .layer(TimeoutLayer::with_status_code(
                        StatusCode::REQUEST_TIMEOUT,
                        limits.request_timeout,
                    )),
            ),
        )
        .layer(CompressionLayer::new())
        .layer(ConcurrencyLimitLayer::new(limits.max_inflight.max(1)))
        .layer(middleware::from_fn(log_request_response))
        .with_state(state)
}

async fn healthcheck() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    tracing::debug!(%method, %uri, "request");
    let response = next.run(request).await;
    tracing::info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    response
}

async fn pools_handler(State(state): State<AppState>) -> Json<Vec<PoolStatus>> {
    Json(state.pools.status())
}

async fn run_handler(State(state): State<AppState>, Json(payload): Json<RunRequest>) -> Response {
    let RunRequest {
        code,
        language,
        token,
    } = payload;
    let request_id = Uuid::new_v4().to_string();

    let language: Language = match language.parse() {
        Ok(language) => language,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string(), &request_id),
    };
    if code.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "code required", &request_id);
    }
    if code.len() > state.max_code_bytes {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("code too large; max {} bytes", state.max_code_bytes),
            &request_id,
        );
    }

    let job = JobMessage {
        code,
        token,
        request_id: Some(request_id.clone()),
        trace_id: None,
    };
    let execution = match state.pools.execute(language, job, state.limits).await {
        Ok(execution) => execution,
        Err(err) => return dispatch_error_response(&err, &request_id),
    };

    let result = execution.result;
    let status = if result.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    let body = RunResponse {
        success: result.success,
        error: result.error,
        output: result.output,
        version: result.version,
        files: result.files,
        duration: u64::try_from(execution.duration.as_millis()).unwrap_or(u64::MAX),
    };
    with_request_id((status, Json(body)).into_response(), &request_id)
}

fn dispatch_error_response(err: &DispatchError, request_id: &str) -> Response {
    let (status, message) = match err {
        DispatchError::AcquireTimeout(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Timeout in getting a worker".to_owned(),
        ),
        DispatchError::ExecutionTimeout(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Execution timeout".to_owned())
        }
        DispatchError::PoolClosed => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Service is shutting down".to_owned(),
        ),
        DispatchError::UnsupportedLanguage(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        DispatchError::Publish(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    error_response(status, &message, request_id)
}

fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let response = (
        status,
        Json(ErrorBody {
            error: message.to_owned(),
        }),
    )
        .into_response();
    with_request_id(response, request_id)
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
