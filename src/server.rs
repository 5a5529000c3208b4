//! HTTP surface.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/sessions/{id}/chat` | Ask a question; streams SSE events |
//! | `POST`   | `/sessions/{id}/continue` | Continue a truncated answer; streams SSE events |
//! | `POST`   | `/documents/{id}/search` | Retrieve fragments from one document |
//! | `DELETE` | `/documents/{id}` | Delete a document and everything derived from it |
//!
//! The caller is identified by the `X-User-Id` header. Streaming endpoints
//! respond with `text/event-stream`; failures inside a turn arrive as
//! `error` events. Failures before the stream starts use
//!
//! ```json
//! { "error": { "code": "BAD_REQUEST", "message": "query must not be empty" } }
//! ```

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::app::Services;
use crate::chat::{ContinueRequest, TurnRequest};
use crate::events::ChatEvent;
use crate::models::RetrievedFragment;
use crate::retrieval::MAX_TOP_K;
use crate::store::DocumentStore;

pub const USER_HEADER: &str = "x-user-id";

pub async fn run_server(services: Arc<Services>) -> anyhow::Result<()> {
    let bind_addr = services.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "doctalk server listening");
    axum::serve(listener, router(services)).await?;
    Ok(())
}

pub fn router(services: Arc<Services>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sessions/{id}/chat", post(handle_chat))
        .route("/sessions/{id}/continue", post(handle_continue))
        .route("/documents/{id}/search", post(handle_search))
        .route("/documents/{id}", delete(handle_delete))
        .layer(cors)
        .with_state(services)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "BAD_REQUEST",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "NOT_FOUND",
        message: message.into(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %err, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "INTERNAL_ERROR",
        message: err.to_string(),
    }
}

fn caller(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: format!("missing {} header", USER_HEADER),
        })
}

// ============ SSE ============

fn sse_response(rx: mpsc::Receiver<ChatEvent>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((Ok::<_, Infallible>(event.to_sse()), rx))
    });
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /sessions/{id}/chat ============

#[derive(Deserialize)]
struct ChatBody {
    message: String,
    #[serde(default)]
    mode: Option<String>,
}

async fn handle_chat(
    State(services): State<Arc<Services>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    let user_id = caller(&headers)?;
    if body.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let rx = services.chat.chat(TurnRequest {
        session_id,
        user_id,
        message: body.message,
        mode: body.mode,
    });
    Ok(sse_response(rx))
}

// ============ POST /sessions/{id}/continue ============

#[derive(Deserialize)]
struct ContinueBody {
    message_id: String,
    #[serde(default)]
    mode: Option<String>,
}

async fn handle_continue(
    State(services): State<Arc<Services>>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ContinueBody>,
) -> Result<Response, AppError> {
    let user_id = caller(&headers)?;
    let rx = services.chat.continue_message(ContinueRequest {
        session_id,
        user_id,
        message_id: body.message_id,
        mode: body.mode,
    });
    Ok(sse_response(rx))
}

// ============ POST /documents/{id}/search ============

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<RetrievedFragment>,
}

async fn handle_search(
    State(services): State<Arc<Services>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, AppError> {
    let user_id = caller(&headers)?;
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let doc = services
        .store
        .get_document(&document_id)
        .await
        .map_err(internal)?
        .filter(|d| d.user_id.as_deref().map_or(true, |owner| owner == user_id))
        .ok_or_else(|| not_found(format!("document not found: {}", document_id)))?;

    let top_k = body
        .top_k
        .unwrap_or_else(|| services.retriever.default_top_k(false));
    if top_k == 0 {
        return Err(bad_request("top_k must be >= 1"));
    }
    let top_k = top_k.min(MAX_TOP_K);
    let results = services
        .retriever
        .search(&body.query, &[doc.id], top_k, false)
        .await
        .map_err(internal)?;
    Ok(Json(SearchResponse { results }))
}

// ============ DELETE /documents/{id} ============

#[derive(Serialize)]
struct DeleteResponse {
    deleted: String,
    cleanup_queued: usize,
}

async fn handle_delete(
    State(services): State<Arc<Services>>,
    Path(document_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, AppError> {
    let user_id = caller(&headers)?;
    let report = services
        .teardown
        .delete(&document_id, Some(&user_id))
        .await
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("document not found: {}", document_id)))?;
    Ok(Json(DeleteResponse {
        deleted: report.document_id,
        cleanup_queued: report.queued.len(),
    }))
}
