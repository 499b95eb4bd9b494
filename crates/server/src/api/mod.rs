use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use client_core::{ConnectionSupervisor, TransportError};
use serde::Deserialize;
use shared::{
    error::{ApiError, ApiException, ErrorCode},
    protocol::{EndpointIndex, PairResponse, RootResponse, StatusResponse},
};
use storage::Storage;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const MIN_PHONE_DIGITS: usize = 10;
const PAIR_EXAMPLE: &str = "/pair?number=51929264225";

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) bot_name: String,
    pub(crate) supervisor: ConnectionSupervisor,
    pub(crate) storage: Storage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PairQuery {
    number: Option<String>,
}

#[derive(Debug, Error)]
pub(crate) enum PairingError {
    #[error("phone number is required, e.g. {}", PAIR_EXAMPLE)]
    MissingNumber,
    #[error("invalid phone number '{received}' (at least {} digits)", MIN_PHONE_DIGITS)]
    InvalidNumber { received: String },
    #[error("bot is not connected yet; try again in 10-20 seconds")]
    NotReady,
    #[error("failed to generate pairing code: {0}")]
    Failed(#[from] TransportError),
}

impl PairingError {
    fn status(&self) -> StatusCode {
        match self {
            Self::MissingNumber | Self::InvalidNumber { .. } => StatusCode::BAD_REQUEST,
            Self::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            Self::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::MissingNumber | Self::InvalidNumber { .. } => ErrorCode::Validation,
            Self::NotReady => ErrorCode::NotReady,
            Self::Failed(_) => ErrorCode::Internal,
        }
    }
}

impl From<PairingError> for (StatusCode, Json<ApiError>) {
    fn from(err: PairingError) -> Self {
        let exception = ApiException::new(err.code(), err.to_string());
        (err.status(), Json(ApiError::from(exception)))
    }
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/pair", get(pair))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Digits only: `+51 929-264-225` → `51929264225`.
pub(crate) fn clean_number(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

async fn root(State(state): State<Arc<AppState>>) -> Json<RootResponse> {
    let account = state.supervisor.session().and_then(|session| session.account());
    Json(RootResponse {
        status: "online".into(),
        bot: state.bot_name.clone(),
        connected: state.supervisor.state().is_open(),
        user: account
            .and_then(|account| account.name)
            .unwrap_or_else(|| "Not connected".into()),
        timestamp: Utc::now(),
        endpoints: EndpointIndex {
            pair: PAIR_EXAMPLE.into(),
            status: "/status".into(),
        },
    })
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let connection_state = state.supervisor.state();
    let account = state.supervisor.session().and_then(|session| session.account());
    Json(StatusResponse {
        connected: connection_state.is_open(),
        state: connection_state,
        user: account.as_ref().and_then(|account| account.name.clone()),
        jid: account.map(|account| account.id),
        timestamp: Utc::now(),
    })
}

async fn pair(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PairQuery>,
) -> Result<Json<PairResponse>, (StatusCode, Json<ApiError>)> {
    let number = query
        .number
        .filter(|raw| !raw.trim().is_empty())
        .ok_or(PairingError::MissingNumber)?;
    let number = clean_number(&number);
    if number.len() < MIN_PHONE_DIGITS {
        return Err(PairingError::InvalidNumber { received: number }.into());
    }
    let session = state.supervisor.session().ok_or(PairingError::NotReady)?;

    info!(%number, "requesting pairing code");
    let code = session.request_pairing_code(&number).await.map_err(|err| {
        error!(%number, error = %err, "failed to generate pairing code");
        match err {
            TransportError::NotConnected => PairingError::NotReady,
            other => PairingError::Failed(other),
        }
    })?;
    info!(%number, pairing_code = %code, "pairing code generated");

    Ok(Json(PairResponse {
        success: true,
        instructions: vec![
            "1. Open WhatsApp on your phone".into(),
            "2. Go to Settings > Linked devices".into(),
            "3. Tap \"Link a device\"".into(),
            format!("4. Enter the code: {code}"),
        ],
        pairing_code: code,
        number,
    }))
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.storage.health_check().await.map_err(|err| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, err.to_string())),
        )
    })?;
    Ok("ok")
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
