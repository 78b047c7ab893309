use crate::AppState;
use crate::encoder::StopOutcome;
use crate::error::RelayError;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Extension, Path as AxumPath};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartStreamRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub stream_key: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopStreamRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub success: bool,
    pub message: String,
}

impl StreamResponse {
    fn failure(message: impl Into<String>) -> (StatusCode, Json<Self>) {
        (
            StatusCode::BAD_REQUEST,
            Json(Self {
                success: false,
                message: message.into(),
            }),
        )
    }
}

/// Blank strings count as missing.
fn required(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

pub async fn liveness() -> &'static str {
    "Stream relay is running"
}

pub async fn start_stream(
    Extension(state): Extension<AppState>,
    body: Result<Json<StartStreamRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return StreamResponse::failure(rejection.body_text()),
    };

    let Some(session_id) = required(request.session_id) else {
        return StreamResponse::failure("sessionId is required");
    };
    let Some(stream_key) = required(request.stream_key) else {
        return StreamResponse::failure("streamKey is required");
    };

    match state
        .streams
        .start_streaming(&session_id, &stream_key, request.platform.as_deref())
    {
        Ok(platform) => (
            StatusCode::OK,
            Json(StreamResponse {
                success: true,
                message: format!("Streaming started to {platform}"),
            }),
        ),
        Err(error) => {
            warn!(%session_id, %error, "Failed to start streaming");
            StreamResponse::failure(error.to_string())
        }
    }
}

pub async fn stop_stream(
    Extension(state): Extension<AppState>,
    body: Result<Json<StopStreamRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => return (StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let Some(session_id) = required(request.session_id) else {
        return (StatusCode::BAD_REQUEST, "sessionId is required".to_string());
    };

    match state.streams.stop_streaming(&session_id) {
        Ok(StopOutcome::AlreadyStopping) => (StatusCode::OK, "Stream is already stopping".into()),
        Ok(_) => {
            info!(%session_id, "Stream stop requested");
            (StatusCode::OK, "Stream is stopping".into())
        }
        Err(error) => (StatusCode::BAD_REQUEST, error.to_string()),
    }
}

pub async fn debug_sessions(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.registry.ids())
}

pub async fn debug_session(
    Extension(state): Extension<AppState>,
    AxumPath(session_id): AxumPath<String>,
) -> impl IntoResponse {
    match state.registry.get(&session_id) {
        Some(session) => (StatusCode::OK, Json(session.snapshot())).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(StreamResponse {
                success: false,
                message: RelayError::SessionNotFound(session_id).to_string(),
            }),
        )
            .into_response(),
    }
}
