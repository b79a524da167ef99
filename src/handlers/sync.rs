use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::ApiResult;
use crate::{
    app_state::AppState,
    db::{
        models::{JobStatus, SyncJob},
        now_millis,
    },
    queue::QueueStats,
};

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: JobStatus,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    #[serde(default = "default_retention_days")]
    pub older_than_days: i64,
}

fn default_retention_days() -> i64 {
    7
}

/// GET /api/sync/stats
pub async fn queue_stats(State(state): State<AppState>) -> ApiResult<QueueStats> {
    Ok(Json(state.queue.stats().await?))
}

/// GET /api/sync/jobs?status=failed&limit=..
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Vec<SyncJob>> {
    Ok(Json(
        state.queue.list_by_status(query.status, query.limit).await?,
    ))
}

/// GET /api/sync/jobs/{job_id}
pub async fn get_job(State(state): State<AppState>, Path(job_id): Path<i64>) -> ApiResult<SyncJob> {
    Ok(Json(state.queue.get(job_id).await?))
}

/// POST /api/sync/jobs/{job_id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> ApiResult<SyncJob> {
    Ok(Json(state.queue.cancel(job_id).await?))
}

/// POST /api/sync/jobs/{job_id}/retry
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> ApiResult<SyncJob> {
    Ok(Json(state.queue.retry_failed(job_id).await?))
}

/// POST /api/sync/purge?older_than_days=7
/// Deletes completed and cancelled jobs
pub async fn purge_jobs(
    State(state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> ApiResult<Value> {
    let cutoff = purge_cutoff(now_millis(), query.older_than_days);
    let purged = state.queue.purge_finished(cutoff).await?;

    Ok(Json(json!({ "purged": purged })))
}

/// Oldest `updated_at` that survives a purge. Saturates for absurd ages.
fn purge_cutoff(now: i64, older_than_days: i64) -> i64 {
    now.saturating_sub(older_than_days.max(0).saturating_mul(MILLIS_PER_DAY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app_state::tests::test_state,
        db::models::SyncOperation,
        queue::NewSyncJob,
    };

    #[test]
    fn cutoff_saturates_instead_of_overflowing() {
        let now = 1_700_000_000_000;
        assert_eq!(purge_cutoff(now, 7), now - 7 * MILLIS_PER_DAY);
        assert_eq!(purge_cutoff(now, -3), now);
        assert_eq!(purge_cutoff(now, i64::MAX), i64::MIN);
    }

    #[tokio::test]
    async fn purge_with_huge_age_keeps_everything() {
        let state = test_state().await;
        let job = state
            .queue
            .enqueue(NewSyncJob::new(SyncOperation::PointsUpdate, 1, json!({})))
            .await
            .unwrap();
        state.queue.cancel(job.job_id).await.unwrap();

        let Json(body) = purge_jobs(
            State(state.clone()),
            Query(PurgeQuery {
                older_than_days: i64::MAX,
            }),
        )
        .await
        .unwrap();

        assert_eq!(body, json!({ "purged": 0 }));
        assert_eq!(state.queue.get(job.job_id).await.unwrap().status, JobStatus::Cancelled);
    }
}
