use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use mnemo_common::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::engine::{ChatEngine, IncomingMessage};

#[derive(Clone)]
struct AppState {
    engine: Arc<ChatEngine>,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    user_id: i64,
    message: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    language_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    reply: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
}

pub fn router(engine: Arc<ChatEngine>) -> Router {
    Router::new()
        .route("/v1/chat", post(chat))
        .route("/healthz", get(healthz))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Serve the HTTP surface until the shutdown signal flips.
pub async fn serve(
    host: &str,
    port: u16,
    engine: Arc<ChatEngine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(mnemo_common::Error::Io)?;
    info!("listening on {addr}");

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(mnemo_common::Error::Io)?;
    Ok(())
}

async fn chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> Json<ChatResponse> {
    let reply = state
        .engine
        .handle_message(IncomingMessage {
            user_id: request.user_id,
            text: request.message,
            username: request.username,
            first_name: request.first_name,
            last_name: request.last_name,
            language_code: request.language_code,
        })
        .await;

    Json(ChatResponse {
        reply: reply.text,
        model: reply.served_by,
    })
}

async fn healthz() -> &'static str {
    "ok"
}
