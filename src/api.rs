//! REST API Server for the Reading Agent Orchestrator
//!
//! Exposes session lifecycle and conversation endpoints via HTTP,
//! including a server-sent-events stream for incremental responses.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::models::{Session, SessionPatch, SessionState, Turn, TurnRole};
use crate::orchestrator::{Orchestrator, TurnEvent};
use crate::store::SessionStore;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: Option<Uuid>,
    pub title: String,
    pub paper_path: Option<String>,
    pub markdown_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    /// Empty string is valid: it triggers the guided-report turn.
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ForceStateRequest {
    pub state: String,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn error_status(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::InvalidState(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<dyn SessionStore>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Session Lifecycle
/// =============================

async fn create_session(
    State(state): State<ApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let user_id = req.user_id.unwrap_or_else(Uuid::new_v4);
    let mut session = Session::new(user_id, req.title);
    session.paper_path = req.paper_path;
    session.markdown_path = req.markdown_path;

    info!(session_id = %session.session_id, title = %session.title, "creating session");

    match state.store.create(&session).await {
        Ok(()) => (StatusCode::CREATED, Json(ApiResponse::success(&session))),
        Err(e) => {
            error!(error = %e, "session creation failed");
            (error_status(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

async fn get_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.store.get(session_id).await {
        Ok(Some(session)) => (StatusCode::OK, Json(ApiResponse::success(&session))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("session {} not found", session_id))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Conversation Endpoint
/// =============================

async fn post_message(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    // The snapshot passed to the orchestrator must not yet contain the
    // current user turn; the client sends it separately from history.
    let session = match state.store.get(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("session {} not found", session_id))),
            )
        }
        Err(e) => return (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    };

    let (response, new_state) = match state.orchestrator.process_turn(&req.message, &session).await
    {
        Ok(pair) => pair,
        Err(e) => {
            error!(%session_id, error = %e, "turn processing failed");
            return (error_status(&e), Json(ApiResponse::error(e.to_string())));
        }
    };

    if let Err(e) = persist_turn(&state, &session, &req.message, &response, new_state).await {
        error!(%session_id, error = %e, "turn persistence failed");
        return (error_status(&e), Json(ApiResponse::error(e.to_string())));
    }

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "session_id": session_id,
            "response": response,
            "state": new_state,
        }))),
    )
}

async fn persist_turn(
    state: &ApiState,
    session: &Session,
    user_text: &str,
    response: &str,
    new_state: SessionState,
) -> crate::Result<()> {
    // System-triggered empty turns are not part of the transcript.
    if !user_text.is_empty() {
        state
            .store
            .append_turn(session.session_id, Turn::new(TurnRole::User, user_text))
            .await?;
    }
    state
        .store
        .append_turn(session.session_id, Turn::new(TurnRole::Assistant, response))
        .await?;

    if new_state != session.current_state {
        state
            .store
            .update(session.session_id, SessionPatch::state(new_state))
            .await?;
    }
    Ok(())
}

/// =============================
/// Streaming Endpoint (SSE)
/// =============================

async fn post_message_stream(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> Result<Sse<UnboundedReceiverStream<Result<Event, Infallible>>>, (StatusCode, Json<ApiResponse>)>
{
    let session = match state.store.get(session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                Json(ApiResponse::error(format!("session {} not found", session_id))),
            ))
        }
        Err(e) => return Err((error_status(&e), Json(ApiResponse::error(e.to_string())))),
    };

    let mut turns = state
        .orchestrator
        .process_turn_stream(&req.message, &session)
        .await;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let user_text = req.message.clone();

    tokio::spawn(async move {
        while let Some(event) = turns.recv().await {
            match event {
                TurnEvent::Fragment(fragment) => {
                    let sse = Event::default().event("fragment").data(fragment);
                    if tx.send(Ok(sse)).is_err() {
                        // Client went away; keep draining so persistence
                        // below still runs on Done.
                        continue;
                    }
                }
                TurnEvent::Done {
                    state: new_state,
                    full_response,
                } => {
                    if let Err(e) =
                        persist_turn(&state, &session, &user_text, &full_response, new_state).await
                    {
                        warn!(%session_id, error = %e, "streamed turn persistence failed");
                    }

                    let payload = serde_json::json!({
                        "session_id": session_id,
                        "state": new_state,
                        "response": full_response,
                    });
                    let sse = Event::default().event("done").data(payload.to_string());
                    let _ = tx.send(Ok(sse));
                    break;
                }
            }
        }
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// =============================
/// State Override Endpoint
/// =============================

async fn force_state(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<ForceStateRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let Some(new_state) = SessionState::parse(&req.state) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("unknown state '{}'", req.state))),
        );
    };

    match state.orchestrator.force_transition(session_id, new_state).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(serde_json::json!({
                "session_id": session_id,
                "state": new_state,
            }))),
        ),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>, store: Arc<dyn SessionStore>) -> Router {
    let state = ApiState {
        orchestrator,
        store,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/messages", post(post_message))
        .route("/api/sessions/:id/messages/stream", post(post_message_stream))
        .route("/api/sessions/:id/state", post(force_state))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SessionStore>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator, store);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
