use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::sync_client_balance;
use crate::{
    app_state::AppState,
    db::models::{CardLink, CardLinkStatus},
    db::queries,
    ledger::LedgerContext,
};

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(alias = "type")]
    pub event: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub card_id: Option<String>,
    pub branch_id: Option<i64>,
    pub points: Option<i64>,
    pub reward_id: Option<String>,
}

/// POST /webhooks/luyoa
/// Always acknowledges, even for bodies that do not parse; errors are only
/// logged so the provider does not keep redelivering.
pub async fn luyoa_webhook(
    State(state): State<AppState>,
    payload: Result<Json<WebhookEvent>, JsonRejection>,
) -> Json<Value> {
    let event = match payload {
        Ok(Json(event)) => event,
        Err(rejection) => {
            warn!(
                status = %rejection.status(),
                error = %rejection.body_text(),
                "unreadable webhook body"
            );
            return acknowledged();
        }
    };

    if let Err(e) = process_event(&state, &event).await {
        warn!(event = %event.event, error = %format!("{e:#}"), "webhook processing failed");
    }

    acknowledged()
}

fn acknowledged() -> Json<Value> {
    Json(json!({ "received": true }))
}

pub async fn process_event(state: &AppState, event: &WebhookEvent) -> anyhow::Result<()> {
    let data = &event.data;

    let Some(link) = card_link(state, data).await? else {
        debug!(event = %event.event, card_id = ?data.card_id, "webhook for unknown card");
        return Ok(());
    };

    match event.event.as_str() {
        "card.scanned" => {
            let Some(branch_id) = data.branch_id.or(link.branch_id) else {
                debug!(link_id = link.link_id, "scan without branch, no visit points");
                return Ok(());
            };
            let report = state.evaluator.evaluate_visit(link.client_id, branch_id).await?;
            if report.total_points > 0 {
                sync_client_balance(state, link.client_id, None).await;
            }
            info!(client_id = link.client_id, branch_id, points = report.total_points, "card scanned");
        }
        "points.updated" => {
            let Some(remote_points) = data.points else {
                anyhow::bail!("points.updated without points");
            };
            // Record what the provider holds, then push the local balance if
            // it disagrees.
            queries::mark_card_synced(&state.pool, link.link_id, remote_points).await?;
            let balance = state.ledger.balance(link.client_id).await?;
            if balance != remote_points {
                warn!(
                    client_id = link.client_id,
                    local = balance,
                    remote = remote_points,
                    "provider balance drifted"
                );
                sync_client_balance(state, link.client_id, None).await;
            }
        }
        "reward.redeemed" => {
            let Some(points) = data.points else {
                anyhow::bail!("reward.redeemed without points");
            };
            let ctx = LedgerContext {
                branch_id: link.branch_id,
                ..Default::default()
            }
            .with_description(format!(
                "reward {} redeemed at provider",
                data.reward_id.as_deref().unwrap_or("unknown")
            ));
            let entry = state.ledger.redeem(link.client_id, points, &ctx).await?;
            // The provider already deducted these points.
            queries::mark_card_synced(&state.pool, link.link_id, entry.balance_after).await?;
            info!(client_id = link.client_id, points, "reward redeemed");
        }
        "card.expired" => {
            queries::set_card_link_status(&state.pool, link.link_id, CardLinkStatus::Expired)
                .await?;
            info!(client_id = link.client_id, link_id = link.link_id, "card expired");
        }
        other => debug!(event = other, "ignoring webhook event"),
    }

    Ok(())
}

async fn card_link(state: &AppState, data: &EventData) -> anyhow::Result<Option<CardLink>> {
    match &data.card_id {
        Some(card_id) => queries::get_card_link_by_remote_id(&state.pool, card_id).await,
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app_state::tests::test_state,
        db::models::{CreateClientRequest, JobStatus, LoyaltyConfig, Reason},
    };

    async fn client_with_card(state: &AppState, points: i64) -> CardLink {
        let client = queries::insert_client(
            &state.pool,
            &CreateClientRequest {
                company_id: 1,
                branch_id: None,
                client_number: "C-1".to_string(),
                name: "Grace".to_string(),
            },
        )
        .await
        .unwrap();
        if points > 0 {
            state
                .ledger
                .apply_delta(client.client_id, points, Reason::ManualAdjustment, &LedgerContext::default())
                .await
                .unwrap();
        }
        queries::activate_card_link(&state.pool, client.client_id, None, "card-9", None, None, points)
            .await
            .unwrap()
    }

    fn event(name: &str, data: Value) -> WebhookEvent {
        serde_json::from_value(json!({ "event": name, "data": data })).unwrap()
    }

    #[tokio::test]
    async fn always_acknowledges() {
        let state = test_state().await;
        let Json(body) = luyoa_webhook(
            State(state),
            Ok(Json(event("points.updated", json!({ "cardId": "nope", "points": 3 })))),
        )
        .await;

        assert_eq!(body, json!({ "received": true }));
    }

    #[tokio::test]
    async fn unreadable_bodies_are_still_acknowledged() {
        use axum::{
            Router,
            body::{Body, to_bytes},
            http::{Request, StatusCode, header},
            routing::post,
        };
        use tower::ServiceExt;

        let app = Router::new()
            .route("/webhooks/luyoa", post(luyoa_webhook))
            .with_state(test_state().await);

        let bodies = [
            (Some("application/json"), r#"{"event":"points.updated","data":{"points":"12"}}"#),
            (Some("application/json"), r#"{"data":{}}"#),
            (Some("application/json"), "not json"),
            (None, r#"{"event":"card.expired"}"#),
        ];
        for (content_type, body) in bodies {
            let mut request = Request::post("/webhooks/luyoa");
            if let Some(content_type) = content_type {
                request = request.header(header::CONTENT_TYPE, content_type);
            }
            let response = app
                .clone()
                .oneshot(request.body(Body::from(body)).unwrap())
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::OK, "{body}");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let ack: Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(ack, json!({ "received": true }));
        }
    }

    #[tokio::test]
    async fn reward_redemption_deducts_and_moves_watermark() {
        let state = test_state().await;
        let link = client_with_card(&state, 100).await;

        process_event(
            &state,
            &event("reward.redeemed", json!({ "cardId": "card-9", "points": 30, "rewardId": "r1" })),
        )
        .await
        .unwrap();

        assert_eq!(state.ledger.balance(link.client_id).await.unwrap(), 70);
        let link = queries::get_card_link(&state.pool, link.link_id).await.unwrap().unwrap();
        assert_eq!(link.last_synced_points, 70);
        assert_eq!(state.queue.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn drifted_balance_queues_a_points_update() {
        let state = test_state().await;
        let link = client_with_card(&state, 50).await;

        process_event(
            &state,
            &event("points.updated", json!({ "cardId": "card-9", "points": 20 })),
        )
        .await
        .unwrap();

        let jobs = state.queue.list_by_status(JobStatus::Pending, 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].card_link_id, Some(link.link_id));
        assert_eq!(jobs[0].payload.0["currentPoints"], 50);
    }

    #[tokio::test]
    async fn scan_awards_visit_points() {
        let state = test_state().await;
        let link = client_with_card(&state, 0).await;
        queries::upsert_config(
            &state.pool,
            &LoyaltyConfig {
                company_id: 1,
                enabled: true,
                visit_points: 5,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        process_event(
            &state,
            &event("card.scanned", json!({ "cardId": "card-9", "branchId": 3 })),
        )
        .await
        .unwrap();

        assert_eq!(state.ledger.balance(link.client_id).await.unwrap(), 5);
        assert_eq!(state.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn expiry_marks_link_expired() {
        let state = test_state().await;
        let link = client_with_card(&state, 0).await;

        process_event(&state, &event("card.expired", json!({ "cardId": "card-9" })))
            .await
            .unwrap();

        let link = queries::get_card_link(&state.pool, link.link_id).await.unwrap().unwrap();
        assert_eq!(link.status, CardLinkStatus::Expired);
    }
}
