// HTTP surface of the playground


use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{Playground, collect_run};
use crate::{RagError, Result};

/// Error body returned by every failing endpoint
pub struct ApiError(pub RagError);

impl From<RagError> for ApiError {
    #[inline]
    fn from(error: RagError) -> Self {
        Self(error)
    }
}

impl ApiError {
    #[inline]
    pub fn status(&self) -> StatusCode {
        status_for_kind(self.0.kind())
    }
}

/// HTTP status for an error class
#[inline]
pub fn status_for_kind(kind: &str) -> StatusCode {
    match kind {
        "not_found" => StatusCode::NOT_FOUND,
        "config" => StatusCode::BAD_REQUEST,
        "config_mismatch" => StatusCode::CONFLICT,
        "model" | "embedding" | "fetch" => StatusCode::BAD_GATEWAY,
        "store_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    #[inline]
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.detail(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    pub session_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub message: String,
    pub session_id: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// Router with every playground endpoint
#[inline]
pub fn router(playground: Arc<Playground>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/playground/status", get(status))
        .route("/v1/playground/agents", get(list_agents))
        .route(
            "/v1/playground/agents/{agent_id}/sessions",
            get(list_sessions).post(create_session),
        )
        .route(
            "/v1/playground/agents/{agent_id}/sessions/{session_id}",
            get(get_session).delete(delete_session),
        )
        .route(
            "/v1/playground/agents/{agent_id}/sessions/{session_id}/rename",
            post(rename_session),
        )
        .route("/v1/playground/agents/{agent_id}/runs", post(create_run))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(playground)
}

/// Bind and serve until the process is stopped
#[inline]
pub async fn serve(playground: Arc<Playground>, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| RagError::Config(format!("Invalid listen address {host}:{port}: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Playground listening on http://{}", addr);

    axum::serve(listener, router(playground)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status(State(playground): State<Arc<Playground>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(playground.status().await?))
}

async fn list_agents(State(playground): State<Arc<Playground>>) -> impl IntoResponse {
    Json(playground.agents())
}

async fn list_sessions(
    State(playground): State<Arc<Playground>>,
    Path(agent_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(playground.list_sessions(&agent_id).await?))
}

async fn create_session(
    State(playground): State<Arc<Playground>>,
    Path(agent_id): Path<String>,
    request: Option<Json<CreateSessionRequest>>,
) -> ApiResult<impl IntoResponse> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let session = playground
        .open_session(&agent_id, request.session_name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(playground): State<Arc<Playground>>,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(playground.transcript(&agent_id, &session_id).await?))
}

async fn rename_session(
    State(playground): State<Arc<Playground>>,
    Path((agent_id, session_id)): Path<(String, String)>,
    Json(request): Json<RenameSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let session = playground
        .rename_session(&agent_id, &session_id, &request.name)
        .await?;
    Ok(Json(session))
}

async fn delete_session(
    State(playground): State<Arc<Playground>>,
    Path((agent_id, session_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    playground.delete_session(&agent_id, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_run(
    State(playground): State<Arc<Playground>>,
    Path(agent_id): Path<String>,
    Json(request): Json<RunRequest>,
) -> ApiResult<Response> {
    let (_session, stream) = playground
        .run(&agent_id, &request.message, request.session_id.as_deref())
        .await?;

    if !request.stream {
        let outcome = collect_run(stream).await?;
        return Ok(Json(outcome).into_response());
    }

    let events = stream.map(|event| {
        Ok::<_, Infallible>(
            Event::default().data(serde_json::to_string(&event).unwrap_or_default()),
        )
    });
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}
