//! A small JSON API over a [`Notebook`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path as UrlPath, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use tokio::{net::TcpListener, signal};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{
    error::PageError,
    notebook::{DocumentSummary, ExportReport, ImportedDocument, Notebook},
    prelude::*,
    store::PageResult,
};

/// Largest PDF we'll accept in one request.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Errors returned by our handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Page(#[from] PageError),

    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Page(PageError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Page(PageError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            ApiError::Page(PageError::Extraction { .. } | PageError::Unreadable { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Page(PageError::Persistence(_)) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Page(PageError::NotFound(_)) => "NOT_FOUND",
            ApiError::Page(PageError::InvalidInput(_)) => "INVALID_INPUT",
            ApiError::Page(PageError::Extraction { .. }) => "EXTRACTION_FAILED",
            ApiError::Page(PageError::Unreadable { .. }) => "UNREADABLE_DOCUMENT",
            ApiError::Page(PageError::Persistence(_)) => "PERSISTENCE_FAILED",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Shared handler state.
type AppState = Arc<Notebook>;

/// Build our router.
pub fn router(notebook: Arc<Notebook>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents", get(list_documents))
        .route(
            "/documents/{name}",
            put(import_document).delete(delete_document),
        )
        .route("/documents/{name}/pages", get(page_count))
        .route(
            "/documents/{name}/pages/{page}/text",
            get(page_text).put(edit_page_text),
        )
        .route("/documents/{name}/pages/{page}/refine", post(refine_page))
        .route("/documents/{name}/pages/{page}/image", get(page_image))
        .route("/documents/{name}/text", get(text_range))
        .route("/documents/{name}/export", post(export))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(notebook)
}

/// Serve `notebook` on `addr` until we're interrupted.
pub async fn serve(
    notebook: Arc<Notebook>,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<()> {
    let app = router(notebook, request_timeout);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {addr}"))?;
    info!(%addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;
    info!("Server shut down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_documents(State(notebook): State<AppState>) -> ApiResult<Json<Vec<DocumentSummary>>> {
    Ok(Json(notebook.documents().await?))
}

async fn import_document(
    State(notebook): State<AppState>,
    UrlPath(name): UrlPath<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<ImportedDocument>)> {
    let imported = notebook.import(&name, body.to_vec()).await?;
    Ok((StatusCode::CREATED, Json(imported)))
}

async fn delete_document(
    State(notebook): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<StatusCode> {
    notebook.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn page_count(
    State(notebook): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> ApiResult<Json<Value>> {
    let page_count = notebook.page_count(&name).await?;
    Ok(Json(json!({ "name": name, "page_count": page_count })))
}

async fn page_text(
    State(notebook): State<AppState>,
    UrlPath((name, page)): UrlPath<(String, u32)>,
) -> ApiResult<Json<PageResult>> {
    Ok(Json(notebook.fetch_page(&name, page).await?))
}

/// Body of `PUT /documents/{name}/pages/{page}/text`.
#[derive(Debug, Deserialize)]
struct EditRequest {
    text: String,
}

async fn edit_page_text(
    State(notebook): State<AppState>,
    UrlPath((name, page)): UrlPath<(String, u32)>,
    Json(request): Json<EditRequest>,
) -> ApiResult<Json<PageResult>> {
    Ok(Json(notebook.edit(&name, page, request.text).await?))
}

async fn refine_page(
    State(notebook): State<AppState>,
    UrlPath((name, page)): UrlPath<(String, u32)>,
) -> ApiResult<Json<PageResult>> {
    Ok(Json(notebook.refine_page(&name, page).await?))
}

async fn page_image(
    State(notebook): State<AppState>,
    UrlPath((name, page)): UrlPath<(String, u32)>,
) -> ApiResult<Response> {
    let path = notebook.preview(&name, page).await?;
    let png = tokio::fs::read(&path)
        .await
        .with_context(|| format!("cannot read {:?}", path.display()))
        .map_err(ApiError::Internal)?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// Query string of `GET /documents/{name}/text`.
#[derive(Debug, Deserialize)]
struct RangeQuery {
    start: u32,
    end: Option<u32>,
}

/// One page in a range response. Exactly one of `text` and `error` is set.
#[derive(Debug, Serialize)]
struct PageText {
    page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn text_range(
    State(notebook): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<Vec<PageText>>> {
    let pages = notebook.text_range(&name, query.start, query.end).await?;
    let pages = pages
        .into_iter()
        .map(|(page, result)| match result {
            Ok(text) => PageText {
                page,
                text: Some(text),
                error: None,
            },
            Err(err) => PageText {
                page,
                text: None,
                error: Some(err.to_string()),
            },
        })
        .collect();
    Ok(Json(pages))
}

/// Body of `POST /documents/{name}/export`.
#[derive(Debug, Deserialize)]
struct ExportRequest {
    pages: Vec<u32>,
}

async fn export(
    State(notebook): State<AppState>,
    UrlPath(name): UrlPath<String>,
    Json(request): Json<ExportRequest>,
) -> ApiResult<Json<ExportReport>> {
    Ok(Json(notebook.export(&name, &request.pages).await?))
}
