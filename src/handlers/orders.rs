use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ApiError, ApiResult, sync_client_balance};
use crate::{
    app_state::AppState,
    db::{
        models::{CreateOrderRequest, LoyaltyConfig, Order},
        queries,
    },
    milestones::{EvaluationError, EvaluationReport},
};

#[derive(Debug, Deserialize)]
pub struct OrderPaymentRequest {
    pub advance_cents: Option<i64>,
    pub sent_to_production: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct RecordedOrder {
    pub order: Order,
    pub evaluation: EvaluationReport,
}

/// POST /api/orders
/// Stores an order and awards the points it earns
pub async fn record_order(
    State(state): State<AppState>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<RecordedOrder>), ApiError> {
    if req.total_cents < 0 || req.advance_cents < 0 {
        return Err(ApiError::bad_request("amounts must not be negative"));
    }
    queries::get_client(&state.pool, req.client_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("client not found: {}", req.client_id)))?;

    let order = queries::insert_order(&state.pool, &req).await?;
    let evaluation = state.evaluator.evaluate_order(order.order_id).await?;
    if evaluation.total_points > 0 {
        sync_client_balance(&state, order.client_id, Some(order.order_id)).await;
    }

    Ok((StatusCode::CREATED, Json(RecordedOrder { order, evaluation })))
}

/// PATCH /api/orders/{order_id}/payment
/// Records an advance or the hand-off to production and awards the points
/// the order earns once it qualifies
pub async fn update_order_payment(
    State(state): State<AppState>,
    Path(order_id): Path<i64>,
    Json(req): Json<OrderPaymentRequest>,
) -> ApiResult<RecordedOrder> {
    if req.advance_cents.is_some_and(|cents| cents < 0) {
        return Err(ApiError::bad_request("advance_cents must not be negative"));
    }

    let order = queries::update_order_payment(
        &state.pool,
        order_id,
        req.advance_cents,
        req.sent_to_production,
    )
    .await?
    .ok_or_else(|| ApiError::not_found(format!("order not found: {order_id}")))?;

    let evaluation = match state.evaluator.evaluate_order(order_id).await {
        Ok(report) => report,
        Err(EvaluationError::AlreadyEvaluated(_)) => {
            debug!(order_id, "order already evaluated, payment update only");
            EvaluationReport::empty(order.client_id)
        }
        Err(e) => return Err(e.into()),
    };
    if evaluation.total_points > 0 {
        sync_client_balance(&state, order.client_id, Some(order_id)).await;
    }

    Ok(Json(RecordedOrder { order, evaluation }))
}

/// PUT /api/configs
/// Replaces the loyalty rules of a company (`branch_id` null) or branch
pub async fn save_config(
    State(state): State<AppState>,
    Json(config): Json<LoyaltyConfig>,
) -> ApiResult<LoyaltyConfig> {
    if config.purchase_amount_enabled && config.purchase_threshold_cents <= 0 {
        return Err(ApiError::bad_request("purchase_threshold_cents must be positive"));
    }
    if config.accumulated_enabled && config.purchases_required <= 0 {
        return Err(ApiError::bad_request("purchases_required must be positive"));
    }

    let saved = queries::upsert_config(&state.pool, &config).await?;
    Ok(Json(saved))
}
