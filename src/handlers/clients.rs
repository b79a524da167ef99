use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, ApiResult, sync_client_balance};
use crate::{
    app_state::AppState,
    db::{
        models::{CardLink, Client, CreateClientRequest, PointsHistoryEntry, Reason},
        queries,
    },
    ledger::{HistoryFilter, LedgerContext, LedgerEntry, Page, PageRequest},
    milestones::EvaluationReport,
};

#[derive(Debug, Serialize)]
pub struct CreatedClient {
    pub client: Client,
    pub registration: EvaluationReport,
}

#[derive(Debug, Serialize)]
pub struct ClientDetails {
    pub client: Client,
    pub card_links: Vec<CardLink>,
}

#[derive(Debug, Deserialize)]
pub struct PointsRequest {
    pub points: i64,
    pub description: Option<String>,
    pub actor_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct VisitRequest {
    pub branch_id: i64,
}

/// POST /api/clients
/// Creates a client and grants the registration bonus
pub async fn create_client(
    State(state): State<AppState>,
    Json(req): Json<CreateClientRequest>,
) -> Result<(StatusCode, Json<CreatedClient>), ApiError> {
    if req.client_number.trim().is_empty() || req.name.trim().is_empty() {
        return Err(ApiError::bad_request("client_number and name are required"));
    }

    let client = queries::insert_client(&state.pool, &req).await?;
    let registration = state.evaluator.evaluate_registration(client.client_id).await?;

    info!(
        client_id = client.client_id,
        bonus = registration.total_points,
        "client created"
    );

    // Reload so the response carries the bonus.
    let client = queries::get_client(&state.pool, client.client_id)
        .await?
        .ok_or_else(|| ApiError::not_found("client disappeared"))?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedClient {
            client,
            registration,
        }),
    ))
}

/// GET /api/clients/{client_id}
pub async fn get_client(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
) -> ApiResult<ClientDetails> {
    let client = queries::get_client(&state.pool, client_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("client not found: {client_id}")))?;
    let card_links = queries::get_active_card_links(&state.pool, client_id).await?;

    Ok(Json(ClientDetails { client, card_links }))
}

/// POST /api/clients/{client_id}/adjust
/// Manual correction, positive or negative
pub async fn adjust_points(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(req): Json<PointsRequest>,
) -> ApiResult<LedgerEntry> {
    let mut ctx = LedgerContext::manual(req.actor_id);
    ctx.description = req.description;

    let entry = state
        .ledger
        .apply_delta(client_id, req.points, Reason::ManualAdjustment, &ctx)
        .await?;
    sync_client_balance(&state, client_id, None).await;

    Ok(Json(entry))
}

/// POST /api/clients/{client_id}/redeem
pub async fn redeem_points(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(req): Json<PointsRequest>,
) -> ApiResult<LedgerEntry> {
    let mut ctx = LedgerContext::manual(req.actor_id);
    ctx.description = req.description;

    let entry = state.ledger.redeem(client_id, req.points, &ctx).await?;
    sync_client_balance(&state, client_id, None).await;

    Ok(Json(entry))
}

/// POST /api/clients/{client_id}/visits
pub async fn record_visit(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Json(req): Json<VisitRequest>,
) -> ApiResult<EvaluationReport> {
    let report = state.evaluator.evaluate_visit(client_id, req.branch_id).await?;
    if report.total_points > 0 {
        sync_client_balance(&state, client_id, None).await;
    }

    Ok(Json(report))
}

/// GET /api/clients/{client_id}/history?reason=..&page=..&limit=..
pub async fn points_history(
    State(state): State<AppState>,
    Path(client_id): Path<i64>,
    Query(filter): Query<HistoryFilter>,
    Query(page): Query<PageRequest>,
) -> ApiResult<Page<PointsHistoryEntry>> {
    // Unknown clients get a 404 rather than an empty page.
    state.ledger.balance(client_id).await?;
    let history = state.ledger.history(client_id, &filter, page).await?;

    Ok(Json(history))
}
