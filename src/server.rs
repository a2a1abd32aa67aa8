//! HTTP and WebSocket surface.
//!
//! `GET /api/sessions/:id/chat` upgrades to the chat relay; the other routes
//! expose warmup, invalidation, status and interrupts for a session.

use anyhow::{Context, Result};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::controller::SandboxController;
use crate::relay::{OutboundMessage, Relay};
use crate::session::Session;
use crate::warmup::WarmupCoordinator;

const CLOSE_NORMAL: u16 = 1000;
const CLOSE_ERROR: u16 = 1011;
const CLOSE_NOT_FOUND: u16 = 4004;

#[derive(Clone)]
pub(crate) struct AppState {
    controller: Arc<SandboxController>,
    warmup: WarmupCoordinator,
    catalog: Catalog,
}

impl AppState {
    pub(crate) fn new(controller: Arc<SandboxController>, catalog: Catalog) -> Self {
        Self {
            warmup: WarmupCoordinator::new(controller.clone()),
            controller,
            catalog,
        }
    }
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.to_string() })))
}

fn internal(err: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    error!(error = %err, "request failed");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err)
}

impl AppState {
    async fn session(&self, session_id: &str) -> Result<Session, (StatusCode, Json<Value>)> {
        match self.catalog.session(session_id).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(api_error(StatusCode::NOT_FOUND, "Session not found")),
            Err(e) => Err(internal(format!("{e:#}"))),
        }
    }
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions/:session_id/chat", get(chat))
        .route("/api/sessions/:session_id/warm", post(warm))
        .route("/api/sessions/:session_id/invalidate", post(invalidate))
        .route("/api/sessions/:session_id/sandbox", get(sandbox_status))
        .route("/api/sessions/:session_id/interrupt", post(interrupt))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub(crate) async fn serve(state: AppState, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server failed")
}

async fn chat(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let session = state.catalog.session(&session_id).await;
    ws.on_upgrade(move |socket| async move {
        match session {
            Ok(Some(session)) => serve_chat(socket, state, session).await,
            Ok(None) => {
                warn!(session = %session_id, "chat for unknown session");
                close(socket, CLOSE_NOT_FOUND, "Session not found").await;
            }
            Err(e) => {
                error!(session = %session_id, "catalog lookup failed: {e:#}");
                close(socket, CLOSE_ERROR, "Catalog unavailable").await;
            }
        }
    })
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn serve_chat(socket: WebSocket, state: AppState, session: Session) {
    info!(session = %session.id, "chat connected");
    let (mut sink, stream) = socket.split();

    let (outbox, mut outgoing) = mpsc::unbounded_channel::<OutboundMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "dropping unserializable message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                return None;
            }
        }
        Some(sink)
    });

    let inbound = stream
        .take_while(|frame| future::ready(matches!(frame, Ok(m) if !matches!(m, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });

    let relay = Relay::new(state.controller.clone(), state.catalog.clone(), session);
    let (code, reason) = match relay.run(inbound, outbox).await {
        Ok(()) => (CLOSE_NORMAL, "Connection closed"),
        Err(e) => {
            error!("relay failed: {e:#}");
            (CLOSE_ERROR, "Relay failure")
        }
    };

    if let Ok(Some(mut sink)) = writer.await {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
    }
}

async fn warm(Path(session_id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let session = state.session(&session_id).await?;
    let timeout = state.controller.config().worker.prewarm_timeout();
    let report = state.warmup.warm(&session, timeout).await;
    Ok(Json(json!({
        "status": report.status(),
        "sandbox_name": report.sandbox_name,
        "is_new": report.is_new,
        "ready": report.is_ready(),
        "error": report.error(),
    })))
}

#[derive(Debug, Default, Deserialize)]
struct InvalidateParams {
    #[serde(default)]
    rewarm: bool,
}

async fn invalidate(
    Path(session_id): Path<String>,
    Query(params): Query<InvalidateParams>,
    State(state): State<AppState>,
) -> ApiResult {
    let session = state.session(&session_id).await?;
    let (report, rewarming) = if params.rewarm {
        let (report, warming) = state
            .warmup
            .invalidate_and_warm(&session)
            .await
            .map_err(internal)?;
        (report, warming.is_some())
    } else {
        (
            state.controller.invalidate(&session).await.map_err(internal)?,
            false,
        )
    };
    Ok(Json(json!({
        "invalidated": report.invalidated,
        "sandbox_name": report.sandbox_name,
        "message": report.message,
        "rewarming": rewarming,
    })))
}

async fn sandbox_status(Path(session_id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let session = state.session(&session_id).await?;
    let status = state.controller.status(&session).await.map_err(internal)?;
    Ok(Json(json!(status)))
}

async fn interrupt(Path(session_id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let session = state.session(&session_id).await?;
    let report = state.controller.interrupt(&session).await.map_err(internal)?;
    Ok(Json(json!(report)))
}
