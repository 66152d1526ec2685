//! HTTP dispatcher.
//!
//! Layering, outermost first: request tracing, CORS, the shared-secret gate,
//! then panic capture around the handlers. The gate wraps the fallback too, so
//! an unknown path without a secret is a 401 rather than a 404.

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge_proto::{ErrorBody, HealthResponse, OkResponse, PathResponse};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::BridgeContext;
use crate::actuation::WriteError;
use crate::auth;
use crate::error::{BridgeError, BridgeResult};
use crate::request::{
    ExecRequest, ListenRequest, Params, RequestError, TextRequest, VibrateRequest, WriteFileRequest,
};

pub type AppState = Arc<BridgeContext>;

/// Largest body the auth gate will buffer while looking for a secret.
const MAX_AUTH_BODY_BYTES: usize = 2 * 1024 * 1024;

const CORS_ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Authorization, Content-Type, X-Auth";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<RequestError> for ApiError {
    fn from(e: RequestError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<WriteError> for ApiError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::OutsideRoot(_) => Self::Forbidden(e.to_string()),
            WriteError::Io(_) => Self::Internal(e.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ─── Router ───────────────────────────────────────────────────────────────────

pub fn router(ctx: AppState) -> Router {
    with_layers(routes(), ctx)
}

fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/exec", get(exec).post(exec))
        .route("/toast", get(toast).post(toast))
        .route("/speak", get(speak).post(speak))
        .route("/vibrate", get(vibrate).post(vibrate))
        .route("/listen", get(listen).post(listen))
        .route("/write_file", get(write_file).post(write_file))
        .route("/status", get(status))
        .route("/push_state", post(push_state))
}

/// Wrap `routes` in the fallbacks and middleware stack and attach the state.
pub fn with_layers(routes: Router<AppState>, ctx: AppState) -> Router {
    routes
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(ctx.clone(), require_secret))
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind `host:port`, walking forward through `fallbacks` further ports while
/// the address is in use.
pub async fn bind_with_fallback(
    host: &str,
    port: u16,
    fallbacks: u16,
) -> BridgeResult<TcpListener> {
    let mut last_err = None;
    for offset in 0..=fallbacks {
        let Some(candidate) = port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if offset > 0 {
                    warn!(
                        requested = port,
                        bound = candidate,
                        "requested port busy, using fallback"
                    );
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                debug!(port = candidate, "port in use");
                last_err = Some(e);
            }
            Err(e) => return Err(BridgeError::Bind(format!("{host}:{candidate}: {e}"))),
        }
    }
    let reason = last_err.map_or_else(|| "no port available".to_string(), |e| e.to_string());
    Err(BridgeError::Bind(format!(
        "{host}:{port} and {fallbacks} fallback port(s) unavailable: {reason}"
    )))
}

/// Serve until the context's shutdown signal fires.
pub async fn serve(listener: TcpListener, ctx: AppState) -> BridgeResult<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "http dispatcher listening");
    let shutdown = ctx.shutdown.triggered_owned();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("http dispatcher stopped");
    Ok(())
}

// ─── Middleware ───────────────────────────────────────────────────────────────

async fn cors(req: Request, next: Next) -> Response {
    let mut resp = if req.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = resp.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    resp
}

async fn require_secret(State(ctx): State<AppState>, req: Request, next: Next) -> Response {
    if auth::is_exempt(req.method(), req.uri().path()) {
        return next.run(req).await;
    }

    let expected = ctx.config.auth_secret.as_str();
    if expected.is_empty() {
        warn!(path = %req.uri().path(), "no shared secret configured, denying");
        return ApiError::Unauthorized.into_response();
    }

    if auth::any_matches(expected, auth::header_candidates(req.headers())) {
        return next.run(req).await;
    }

    if let Ok(Query(query)) = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        && auth::any_matches(expected, auth::query_candidates(&query))
    {
        return next.run(req).await;
    }

    if req.method() != Method::GET {
        // Buffer the body to look for a secret, then hand the same bytes on.
        let (parts, body) = req.into_parts();
        let bytes = match axum::body::to_bytes(body, MAX_AUTH_BODY_BYTES).await {
            Ok(b) => b,
            Err(e) => return ApiError::BadRequest(format!("unreadable body: {e}")).into_response(),
        };
        let authorized = serde_json::from_slice::<Value>(&bytes)
            .is_ok_and(|v| auth::any_matches(expected, auth::body_candidates(&v)));
        if authorized {
            return next.run(Request::from_parts(parts, Body::from(bytes))).await;
        }
        debug!(path = %parts.uri.path(), "unauthorized request");
        return ApiError::Unauthorized.into_response();
    }

    debug!(path = %req.uri().path(), "unauthorized request");
    ApiError::Unauthorized.into_response()
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "handler panicked");
    ApiError::Internal("internal error".to_string()).into_response()
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

async fn health(State(ctx): State<AppState>) -> Json<HealthResponse> {
    let battery = ctx
        .latest_state()
        .map(|s| s.battery_pct)
        .filter(|pct| *pct >= 0);
    Json(HealthResponse {
        status: "online".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime: ctx.uptime().as_secs_f64(),
        battery,
    })
}

async fn exec(State(ctx): State<AppState>, params: Params) -> ApiResult<Response> {
    let req = ExecRequest::from_params(&params)?;
    let result = ctx.executor.exec(&req.command, req.timeout_secs).await;
    let status = if result.is_denied() {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };
    Ok((status, Json(result)).into_response())
}

async fn toast(State(ctx): State<AppState>, params: Params) -> ApiResult<Json<OkResponse>> {
    let req = TextRequest::from_params(&params)?;
    let result = ctx.actuator.toast(&req.text).await;
    Ok(Json(OkResponse { ok: result.success() }))
}

async fn speak(State(ctx): State<AppState>, params: Params) -> ApiResult<Json<OkResponse>> {
    let req = TextRequest::from_params(&params)?;
    let result = ctx.actuator.speak(&req.text).await;
    Ok(Json(OkResponse { ok: result.success() }))
}

async fn vibrate(State(ctx): State<AppState>, params: Params) -> ApiResult<Json<OkResponse>> {
    let req = VibrateRequest::from_params(&params)?;
    let result = ctx.actuator.vibrate(req.duration_ms).await;
    Ok(Json(OkResponse { ok: result.success() }))
}

async fn listen(State(ctx): State<AppState>, params: Params) -> ApiResult<Json<PathResponse>> {
    let req = ListenRequest::from_params(&params)?;
    let (path, result) = ctx.actuator.listen(req.duration_secs).await;
    Ok(Json(PathResponse {
        ok: result.success(),
        path: path.to_string_lossy().to_string(),
        bytes: None,
    }))
}

async fn write_file(State(ctx): State<AppState>, params: Params) -> ApiResult<Json<PathResponse>> {
    let req = WriteFileRequest::from_params(&params)?;
    let (path, bytes) = ctx.actuator.write_file(&req.path, &req.content).await?;
    Ok(Json(PathResponse {
        ok: true,
        path: path.to_string_lossy().to_string(),
        bytes: Some(bytes),
    }))
}

async fn status(State(ctx): State<AppState>) -> Response {
    let last_push_ok = ctx.latest_state().and_then(|s| s.last_push_ok);
    Json(ctx.probe.collect(last_push_ok).await).into_response()
}

async fn push_state(State(ctx): State<AppState>) -> ApiResult<Json<OkResponse>> {
    let last_push_ok = ctx.latest_state().and_then(|s| s.last_push_ok);
    match ctx.push_state_now(last_push_ok).await {
        Some(pushed) => Ok(Json(OkResponse { ok: pushed.is_ok() })),
        None => Err(ApiError::Unavailable("state store not configured".to_string())),
    }
}
