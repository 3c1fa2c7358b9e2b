//! JSON-over-HTTP surface
//!
//! Every response body is an envelope:
//!
//! ```json
//! {"status": "success", "message": "...", "data": ...}
//! {"status": "error", "message": "...", "details": {"kind": "statement"}}
//! ```

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::descriptor::ConnectionDescriptor;
use crate::error::{DatabaseError, ErrorKind};
use crate::service::QueryService;

#[derive(Clone)]
pub struct AppState {
    pub service: QueryService,
}

#[derive(Debug, Deserialize)]
pub struct StructureRequest {
    pub connection: ConnectionDescriptor,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub query: String,
    pub connection: ConnectionDescriptor,
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

fn success<T: Serialize>(message: &str, data: T) -> Response {
    let body = Envelope {
        status: "success",
        message: message.to_string(),
        data: Some(data),
        details: None,
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Error half of every handler
#[derive(Debug)]
pub enum ApiError {
    Database(DatabaseError),
    BadRequest(String),
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        Self::Database(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::Connectivity => StatusCode::BAD_GATEWAY,
        ErrorKind::Statement => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ScopeViolation => StatusCode::NOT_FOUND,
    }
}

fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Configuration => "configuration",
        ErrorKind::Connectivity => "connectivity",
        ErrorKind::Statement => "statement",
        ErrorKind::ScopeViolation => "scope_violation",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            Self::Database(err) => {
                let kind = err.kind();
                (status_for(kind), kind_name(kind), err.public_message())
            }
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "configuration", message),
        };
        if status.is_server_error() {
            log::warn!("{}: {}", status, message);
        }
        let body: Envelope<()> = Envelope {
            status: "error",
            message,
            data: None,
            details: Some(json!({ "kind": kind })),
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> Response {
    success("ok", json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn structure(
    State(state): State<AppState>,
    payload: Result<Json<StructureRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let structure = state.service.get_structure(&request.connection).await?;
    Ok(success("Database structure retrieved", structure))
}

async fn prompt_context(
    State(state): State<AppState>,
    payload: Result<Json<StructureRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let context = state.service.prompt_context(&request.connection).await?;
    Ok(success("Prompt context generated", context))
}

async fn execute(
    State(state): State<AppState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    let result = state.service.run(&request.connection, &request.query).await?;
    Ok(success("Query executed", result))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queries/structure", post(structure))
        .route("/queries/execute", post(execute))
        .route("/queries/prompt_context", post(prompt_context))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until Ctrl-C, then close every pool
pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    use anyhow::Context;

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                settings.server.host, settings.server.port
            )
        })?;

    let service = QueryService::from_settings(settings);
    let app = router(AppState {
        service: service.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    log::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await
        .context("HTTP server failed")?;

    service.shutdown().await;
    Ok(())
}
