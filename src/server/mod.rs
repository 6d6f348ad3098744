/// HTTP API for the anchoring pipeline.
///
/// A thin layer over [`Anchorer`] and [`Verifier`]: every route maps onto
/// one orchestrator operation, and every [`AnchorError`] onto a status
/// code. Writes are signed with the server's configured identity.
pub mod routes;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AnchorConfig;
use crate::crypto::identity::Identity;
use crate::error::AnchorError;
use crate::pipeline::Anchorer;
use crate::verify::Verifier;

/// Shared application state available to all handlers.
pub struct AppState {
    pub anchorer: Arc<Anchorer>,
    pub verifier: Verifier,
    /// Signs ledger writes made through the API.
    pub identity: Arc<dyn Identity>,
    /// Public gateway base for payload links.
    pub gateway_url: Option<String>,
    /// Block explorer base for transaction links.
    pub explorer_url: Option<String>,
}

impl AppState {
    pub fn new(anchorer: Arc<Anchorer>, identity: Arc<dyn Identity>) -> Self {
        let verifier = Verifier::new(anchorer.storage(), anchorer.ledger());
        Self {
            anchorer,
            verifier,
            identity,
            gateway_url: None,
            explorer_url: None,
        }
    }

    /// Take link bases from `config`. No explorer links for a simulated ledger.
    pub fn with_links(mut self, config: &AnchorConfig) -> Self {
        self.gateway_url = config.storage.gateway_url.clone();
        self.explorer_url = (!config.ledger.simulate).then(|| config.ledger.explorer_url.clone());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Whether the same request may succeed later.
    pub retryable: bool,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a pipeline error onto an HTTP response.
pub fn error_response(err: AnchorError) -> ApiError {
    let status = match &err {
        AnchorError::Encoding(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AnchorError::StorageUnavailable { .. } | AnchorError::Storage(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        AnchorError::Connectivity(_) | AnchorError::WrongNetwork { .. } => StatusCode::BAD_GATEWAY,
        AnchorError::ConfirmationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        AnchorError::DuplicateRecordId(_) | AnchorError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        AnchorError::UnknownRecordId(_) => StatusCode::NOT_FOUND,
        AnchorError::Authorization(_) => StatusCode::FORBIDDEN,
        AnchorError::LedgerRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AnchorError::Cancelled(_) => StatusCode::CONFLICT,
        AnchorError::Decryption(_) => StatusCode::UNPROCESSABLE_ENTITY,
        AnchorError::Encryption(_)
        | AnchorError::Config(_) | AnchorError::Io(_) | AnchorError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    if status.is_server_error() {
        tracing::warn!(status = %status, error = %err, "Request failed");
    }

    (
        status,
        Json(ErrorResponse {
            retryable: err.is_retryable(),
            error: err.to_string(),
        }),
    )
}

/// Build the Axum application with all routes and middleware.
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health_routes())
        .merge(routes::record_routes())
        .merge(routes::attachment_routes())
        .with_state(Arc::new(state))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Start the API server.
pub async fn serve(state: AppState, addr: &str) -> crate::error::Result<()> {
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(AnchorError::Io)?;

    tracing::info!("evidence-anchor API listening on {addr}");

    axum::serve(listener, app).await.map_err(AnchorError::Io)?;

    Ok(())
}
