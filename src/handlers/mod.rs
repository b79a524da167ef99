pub mod cards;
pub mod clients;
pub mod orders;
pub mod sync;
pub mod webhook;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::{
    app_state::AppState,
    credential::CodecError,
    db::{models::SyncOperation, queries},
    ledger::LedgerError,
    milestones::EvaluationError,
    queue::{NewSyncJob, QueueError},
};

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: String,
    pub reason: String,
}

/// Error returned by the admin API as `{"status": "ERROR", "reason": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, reason)
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        error!(error = %e, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            status: "ERROR".to_string(),
            reason: self.reason,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::internal(format!("{e:#}"))
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::ClientNotFound(_) => Self::not_found(e.to_string()),
            LedgerError::ZeroAmount
            | LedgerError::InvalidAmount(_)
            | LedgerError::InsufficientPoints { .. } => Self::bad_request(e.to_string()),
            LedgerError::Database(_) => Self::internal(e),
        }
    }
}

impl From<EvaluationError> for ApiError {
    fn from(e: EvaluationError) -> Self {
        match e {
            EvaluationError::OrderNotFound(_) | EvaluationError::ClientNotFound(_) => {
                Self::not_found(e.to_string())
            }
            EvaluationError::AlreadyEvaluated(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
            EvaluationError::Ledger(inner) => inner.into(),
            EvaluationError::Database(_) => Self::internal(e),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::NotFound(_) => Self::not_found(e.to_string()),
            QueueError::InvalidPriority(_) | QueueError::InvalidMaxRetries(_) => {
                Self::bad_request(e.to_string())
            }
            QueueError::InvalidTransition { .. } | QueueError::LeaseLost(_) => {
                Self::new(StatusCode::CONFLICT, e.to_string())
            }
            QueueError::Database(_) => Self::internal(e),
        }
    }
}

impl From<CodecError> for ApiError {
    fn from(e: CodecError) -> Self {
        Self::internal(e)
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK" }))
}

/// Queues a `points_update` carrying the current balance for every active
/// card of the client. Failures are logged and never reach the caller.
pub async fn sync_client_balance(state: &AppState, client_id: i64, order_id: Option<i64>) {
    if let Err(e) = enqueue_balance_sync(state, client_id, order_id).await {
        warn!(client_id, error = %e, "failed to queue points sync");
    }
}

async fn enqueue_balance_sync(
    state: &AppState,
    client_id: i64,
    order_id: Option<i64>,
) -> anyhow::Result<()> {
    let links = queries::get_active_card_links(&state.pool, client_id).await?;
    if links.is_empty() {
        return Ok(());
    }

    let balance = state.ledger.balance(client_id).await?;
    for link in links.iter().filter(|link| link.needs_sync(balance)) {
        let job = NewSyncJob::new(
            SyncOperation::PointsUpdate,
            client_id,
            json!({ "currentPoints": balance }),
        )
        .with_card_link(link.link_id)
        .with_branch(link.branch_id)
        .with_order(order_id);
        state.queue.enqueue(job).await?;
    }

    Ok(())
}
