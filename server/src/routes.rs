// HTTP and WebSocket surface of the assistant

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Path, Request, State, WebSocketUpgrade,
    },
    http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use llm_core::{AudioFormat, Recording};
use serde::{Deserialize, Serialize};
use speech_core::{SessionId, Voice};
use tokio::sync::broadcast::error::RecvError;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::config::AssistantConfig;
use crate::error::ApiError;
use crate::metrics::MetricsResponse;
use crate::orchestrator::{Orchestrator, StartedSession, StateSnapshot};
use crate::validation::{parse_session_id, parse_voice, validate_transcript};

/// Recordings larger than this are rejected.
const MAX_RECORDING_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Arc<AssistantConfig>,
}

#[derive(Deserialize)]
pub struct StartSessionRequest {
    transcript: String,
    voice: Option<String>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    session_id: SessionId,
}

#[derive(Serialize)]
pub struct VoicesResponse {
    voices: Vec<Voice>,
    default: Voice,
}

#[derive(Serialize)]
pub struct StopResponse {
    stopped: bool,
}

/// Build the full application with middleware.
pub fn router(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(cors_layer(state.config.cors_allowed_origins.as_deref()))
        .into_inner();

    Router::new()
        .route("/health", get(health_check))
        .route("/voices", get(list_voices))
        .route("/state", get(current_state))
        .route("/capture/start", post(capture_start))
        .route("/capture/stop", post(capture_stop))
        .route("/sessions", post(start_session))
        .route("/sessions/{id}/cancel", post(cancel_session))
        .route("/stop", post(stop))
        .route("/history", delete(clear_history))
        .route("/metrics", get(metrics_endpoint))
        .route("/events", get(events_ws))
        .layer(DefaultBodyLimit::max(MAX_RECORDING_BYTES))
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state)
}

fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    let origins: Vec<HeaderValue> = allowed_origins
        .unwrap_or_default()
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("invalid"));
    request
        .headers_mut()
        .insert("x-request-id", request_id.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert("x-request-id", request_id);
    response
}

pub async fn health_check() -> &'static str {
    "ok"
}

pub async fn list_voices(State(state): State<AppState>) -> Json<VoicesResponse> {
    Json(VoicesResponse {
        voices: Voice::ALL.to_vec(),
        default: state.orchestrator.default_voice(),
    })
}

pub async fn current_state(State(state): State<AppState>) -> Json<StateSnapshot> {
    Json(state.orchestrator.snapshot().await)
}

pub async fn capture_start(State(state): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    state.orchestrator.capture_started().await?;
    Ok(Json(state.orchestrator.snapshot().await))
}

/// Body is the finished recording; `Content-Type` names its container.
pub async fn capture_stop(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<StartedSession>), ApiError> {
    if body.is_empty() {
        return Err(ApiError::InvalidInput("Recording cannot be empty".to_string()));
    }
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("audio/wav");
    let format = AudioFormat::from_content_type(content_type)?;

    let started = state
        .orchestrator
        .capture_stopped(Recording {
            bytes: body,
            format,
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

pub async fn start_session(
    State(state): State<AppState>,
    Json(req): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    validate_transcript(&req.transcript)?;
    let voice = parse_voice(req.voice.as_deref())?;
    let session_id = state
        .orchestrator
        .start_session(req.transcript.trim(), voice)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(SessionResponse { session_id })))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = parse_session_id(&id)?;
    state.orchestrator.cancel_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop(State(state): State<AppState>) -> Result<Json<StopResponse>, ApiError> {
    let stopped = state.orchestrator.stop().await?;
    Ok(Json(StopResponse { stopped }))
}

pub async fn clear_history(State(state): State<AppState>) -> StatusCode {
    state.orchestrator.clear_history().await;
    StatusCode::NO_CONTENT
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(state.orchestrator.metrics().snapshot())
}

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let events = state.orchestrator.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, events))
}

async fn forward_events(
    socket: WebSocket,
    mut events: tokio::sync::broadcast::Receiver<crate::events::UiEvent>,
) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("could not serialize event: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, {skipped} events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("event subscriber disconnected");
}
