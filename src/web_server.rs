use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::streaming::{
    responder, CameraStatus, CaptureStats, ClientSession, FrameSlot, StartFailure,
    StreamUnavailable, VideoControl,
};

const VIEWER_HTML: &str = include_str!("../web/viewer.html");

/// Web server state
#[derive(Clone)]
pub struct AppState {
    pub control: VideoControl,
    pub slot: Arc<FrameSlot>,
    pub stats: Arc<CaptureStats>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(control: VideoControl, config: Arc<Config>) -> Self {
        let slot = Arc::clone(control.capture().slot());
        let stats = Arc::clone(control.capture().stats());
        Self {
            control,
            slot,
            stats,
            config,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Camera not available")]
    StreamUnavailable,

    #[error("{message}")]
    StartFailed {
        message: String,
        status: Box<CameraStatus>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StreamUnavailable> for ApiError {
    fn from(_: StreamUnavailable) -> Self {
        ApiError::StreamUnavailable
    }
}

impl From<StartFailure> for ApiError {
    fn from(failure: StartFailure) -> Self {
        ApiError::StartFailed {
            message: failure.error.to_string(),
            status: Box::new(failure.status),
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::StreamUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "Camera not available").into_response()
            }
            ApiError::StartFailed { message, status } => {
                error!(reason = %message, "Camera start failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ControlResponse {
                        status: "error",
                        message,
                        camera: *status,
                    }),
                )
                    .into_response()
            }
            ApiError::Internal(message) => {
                error!(error = %message, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({ "status": "error", "message": message })),
                )
                    .into_response()
            }
        }
    }
}

/// Start/stop response: outcome plus the resulting camera status
#[derive(Serialize)]
struct ControlResponse {
    status: &'static str,
    message: String,
    #[serde(flatten)]
    camera: CameraStatus,
}

#[derive(Serialize)]
struct StreamUrlResponse {
    stream_url: String,
    status_url: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/video_feed", get(video_feed_handler))
        .route("/api/camera/status", get(status_handler))
        .route("/api/camera/start", post(start_handler))
        .route("/api/camera/stop", post(stop_handler))
        .route("/api/stream_url", get(stream_url_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn run_server<F>(listener: TcpListener, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Web server listening on http://{}", addr);
    info!(
        "Stream available at http://{}:{}/video_feed",
        state.config.public_ip(),
        addr.port()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let camera = &state.config.camera;
    Html(VIEWER_HTML.replace(
        "CAMERA_MODE_PLACEHOLDER",
        &format!("{}x{} @ {} fps", camera.width, camera.height, camera.fps),
    ))
}

async fn video_feed_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let session = ClientSession::open(Arc::clone(&state.slot), Arc::clone(&state.stats))?;
    let body = Body::from_stream(session.into_stream(state.config.stream.frame_wait()));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, responder::content_type())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn status_handler(State(state): State<AppState>) -> Json<CameraStatus> {
    Json(state.control.get_status())
}

async fn start_handler(State(state): State<AppState>) -> Result<Json<ControlResponse>, ApiError> {
    let control = state.control.clone();
    let camera = tokio::task::spawn_blocking(move || control.request_start()).await??;

    Ok(Json(ControlResponse {
        status: "success",
        message: "Camera started".to_string(),
        camera,
    }))
}

async fn stop_handler(State(state): State<AppState>) -> Result<Json<ControlResponse>, ApiError> {
    let control = state.control.clone();
    let camera = tokio::task::spawn_blocking(move || control.request_stop()).await?;

    Ok(Json(ControlResponse {
        status: "success",
        message: "Camera stopped".to_string(),
        camera,
    }))
}

async fn stream_url_handler(State(state): State<AppState>) -> Json<StreamUrlResponse> {
    let base = format!(
        "http://{}:{}",
        state.config.public_ip(),
        state.config.server.port
    );

    Json(StreamUrlResponse {
        stream_url: format!("{}/video_feed", base),
        status_url: format!("{}/api/camera/status", base),
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
