//! Durable queue of provider sync jobs.
//!
//! Jobs live in the `sync_jobs` table. Workers claim them with
//! [`SyncQueue::lease_next`], a single `UPDATE … RETURNING` that picks the
//! best eligible job and stamps a time-limited lease on it. The lease is
//! advisory: completion and failure only apply while the caller still holds
//! it, and a job whose lease ran out can be claimed again, which is how a
//! crashed worker's job gets picked back up.

use chrono::Duration;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Pool, Sqlite, types::Json};
use tracing::{debug, info, warn};

use crate::db::{
    models::{JobError, JobStatus, SyncJob, SyncOperation},
    now_millis,
};

pub const DEFAULT_PRIORITY: i64 = 5;
pub const DEFAULT_MAX_RETRIES: i64 = 5;
pub const LEASE_DURATION_SECS: i64 = 5 * 60;

const BACKOFF_BASE_SECS: u64 = 60;
const BACKOFF_CAP_SECS: u64 = 30 * 60;

/// Delay before retry number `retry_count`: `min(1min * 2^n, 30min)`.
pub fn backoff(retry_count: i64) -> std::time::Duration {
    let exp = retry_count.clamp(0, 16) as u32;
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << exp)
        .min(BACKOFF_CAP_SECS);
    std::time::Duration::from_secs(secs)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("sync job not found: {0}")]
    NotFound(i64),
    #[error("priority must be between 1 and 10, got {0}")]
    InvalidPriority(i64),
    #[error("max retries must not be negative, got {0}")]
    InvalidMaxRetries(i64),
    #[error("lease on sync job {0} is no longer held")]
    LeaseLost(i64),
    #[error("sync job {job_id} is {status:?}")]
    InvalidTransition { job_id: i64, status: JobStatus },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A job to be enqueued.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub operation: SyncOperation,
    pub client_id: i64,
    pub card_link_id: Option<i64>,
    pub branch_id: Option<i64>,
    pub order_id: Option<i64>,
    pub payload: Value,
    pub priority: i64,
    pub max_retries: i64,
}

impl NewSyncJob {
    pub fn new(operation: SyncOperation, client_id: i64, payload: Value) -> Self {
        Self {
            operation,
            client_id,
            card_link_id: None,
            branch_id: None,
            order_id: None,
            payload,
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_card_link(mut self, card_link_id: i64) -> Self {
        self.card_link_id = Some(card_link_id);
        self
    }

    pub fn with_branch(mut self, branch_id: Option<i64>) -> Self {
        self.branch_id = branch_id;
        self
    }

    pub fn with_order(mut self, order_id: Option<i64>) -> Self {
        self.order_id = order_id;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

#[derive(Clone)]
pub struct SyncQueue {
    pool: Pool<Sqlite>,
    lease_duration: Duration,
}

impl SyncQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            lease_duration: Duration::seconds(LEASE_DURATION_SECS),
        }
    }

    /// Inserts a new pending job. Jobs are never merged with existing ones.
    pub async fn enqueue(&self, job: NewSyncJob) -> Result<SyncJob, QueueError> {
        if !(1..=10).contains(&job.priority) {
            return Err(QueueError::InvalidPriority(job.priority));
        }
        if job.max_retries < 0 {
            return Err(QueueError::InvalidMaxRetries(job.max_retries));
        }

        let now = now_millis();
        let saved = sqlx::query_as::<_, SyncJob>(
            "INSERT INTO sync_jobs (operation, status, priority, client_id, card_link_id,
             branch_id, order_id, payload, retry_count, max_retries, error_history,
             created_at, updated_at)
             VALUES (?, 'pending', ?, ?, ?, ?, ?, ?, 0, ?, '[]', ?, ?)
             RETURNING *",
        )
        .bind(job.operation)
        .bind(job.priority)
        .bind(job.client_id)
        .bind(job.card_link_id)
        .bind(job.branch_id)
        .bind(job.order_id)
        .bind(Json(&job.payload))
        .bind(job.max_retries)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(
            job_id = saved.job_id,
            operation = %saved.operation,
            client_id = saved.client_id,
            priority = saved.priority,
            "sync job enqueued"
        );

        Ok(saved)
    }

    pub async fn lease_next(&self, worker_id: &str) -> Result<Option<SyncJob>, QueueError> {
        self.lease_next_at(worker_id, now_millis()).await
    }

    /// Claims the highest-priority, oldest eligible job as of `now`
    /// (unix milliseconds).
    ///
    /// Eligible: pending with no retry delay left and no live lease, or
    /// processing with an expired lease.
    pub async fn lease_next_at(&self, worker_id: &str, now: i64) -> Result<Option<SyncJob>, QueueError> {
        let expires = now + self.lease_duration.num_milliseconds();

        let job = sqlx::query_as::<_, SyncJob>(
            "UPDATE sync_jobs
             SET status = 'processing', locked_by = ?1, locked_at = ?2, lock_expires_at = ?3,
                 updated_at = ?2
             WHERE job_id = (
                 SELECT job_id FROM sync_jobs
                 WHERE (status = 'pending'
                        AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                        AND (lock_expires_at IS NULL OR lock_expires_at <= ?2))
                    OR (status = 'processing' AND lock_expires_at <= ?2)
                 ORDER BY priority DESC, created_at ASC, job_id ASC
                 LIMIT 1
             )
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            debug!(
                job_id = job.job_id,
                worker = worker_id,
                operation = %job.operation,
                "sync job leased"
            );
        }

        Ok(job)
    }

    pub async fn mark_completed(&self, job: &SyncJob, response: Value) -> Result<SyncJob, QueueError> {
        let now = now_millis();
        let updated = sqlx::query_as::<_, SyncJob>(
            "UPDATE sync_jobs
             SET status = 'completed', response = ?, completed_at = ?, updated_at = ?,
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
             WHERE job_id = ? AND status = 'processing' AND locked_by = ?
             RETURNING *",
        )
        .bind(Json(&response))
        .bind(now)
        .bind(now)
        .bind(job.job_id)
        .bind(job.locked_by.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        let updated = updated.ok_or(QueueError::LeaseLost(job.job_id))?;
        debug!(job_id = job.job_id, "sync job completed");
        Ok(updated)
    }

    pub async fn mark_failed(
        &self,
        job: &SyncJob,
        message: &str,
        code: Option<&str>,
    ) -> Result<SyncJob, QueueError> {
        self.mark_failed_at(job, message, code, now_millis()).await
    }

    /// Records a failed attempt at `now`. The job goes back to pending after
    /// [`backoff`] or, once `max_retries` attempts failed, to `failed`.
    pub async fn mark_failed_at(
        &self,
        job: &SyncJob,
        message: &str,
        code: Option<&str>,
        now: i64,
    ) -> Result<SyncJob, QueueError> {
        let retry_count = job.retry_count + 1;
        let mut history = job.error_history.0.clone();
        history.push(JobError {
            message: message.to_string(),
            code: code.map(String::from),
            occurred_at: now,
            attempt: retry_count,
        });

        let (status, next_retry_at) = if retry_count >= job.max_retries {
            (JobStatus::Failed, None)
        } else {
            let delay = backoff(retry_count).as_millis() as i64;
            (JobStatus::Pending, Some(now + delay))
        };

        let updated = sqlx::query_as::<_, SyncJob>(
            "UPDATE sync_jobs
             SET status = ?, retry_count = ?, next_retry_at = ?, last_error_message = ?,
                 last_error_code = ?, last_error_at = ?, error_history = ?, updated_at = ?,
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
             WHERE job_id = ? AND status = 'processing' AND locked_by = ?
             RETURNING *",
        )
        .bind(status)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(message)
        .bind(code)
        .bind(now)
        .bind(Json(&history))
        .bind(now)
        .bind(job.job_id)
        .bind(job.locked_by.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        let updated = updated.ok_or(QueueError::LeaseLost(job.job_id))?;

        if updated.status == JobStatus::Failed {
            warn!(
                job_id = job.job_id,
                operation = %job.operation,
                retries = retry_count,
                error = message,
                "sync job failed permanently"
            );
        } else {
            debug!(
                job_id = job.job_id,
                retry_count,
                next_retry_at,
                error = message,
                "sync job scheduled for retry"
            );
        }

        Ok(updated)
    }

    pub async fn get(&self, job_id: i64) -> Result<SyncJob, QueueError> {
        sqlx::query_as::<_, SyncJob>("SELECT * FROM sync_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(QueueError::NotFound(job_id))
    }

    pub async fn list_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<SyncJob>, QueueError> {
        let jobs = sqlx::query_as::<_, SyncJob>(
            "SELECT * FROM sync_jobs WHERE status = ?
             ORDER BY priority DESC, created_at ASC, job_id ASC LIMIT ?",
        )
        .bind(status)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Cancels a job that no worker has picked up yet.
    pub async fn cancel(&self, job_id: i64) -> Result<SyncJob, QueueError> {
        let cancelled = sqlx::query_as::<_, SyncJob>(
            "UPDATE sync_jobs SET status = 'cancelled', updated_at = ?
             WHERE job_id = ? AND status = 'pending'
             RETURNING *",
        )
        .bind(now_millis())
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match cancelled {
            Some(job) => {
                info!(job_id, "sync job cancelled");
                Ok(job)
            }
            None => {
                let job = self.get(job_id).await?;
                Err(QueueError::InvalidTransition {
                    job_id,
                    status: job.status,
                })
            }
        }
    }

    /// Operator retry of a permanently failed job: back to pending with a
    /// fresh retry budget. Error history is kept.
    pub async fn retry_failed(&self, job_id: i64) -> Result<SyncJob, QueueError> {
        let retried = sqlx::query_as::<_, SyncJob>(
            "UPDATE sync_jobs
             SET status = 'pending', retry_count = 0, next_retry_at = NULL, updated_at = ?
             WHERE job_id = ? AND status = 'failed'
             RETURNING *",
        )
        .bind(now_millis())
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        match retried {
            Some(job) => {
                info!(job_id, "failed sync job requeued");
                Ok(job)
            }
            None => {
                let job = self.get(job_id).await?;
                Err(QueueError::InvalidTransition {
                    job_id,
                    status: job.status,
                })
            }
        }
    }

    /// Deletes completed and cancelled jobs last touched before `cutoff`
    /// (unix milliseconds).
    pub async fn purge_finished(&self, cutoff: i64) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM sync_jobs
             WHERE status IN ('completed', 'cancelled') AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(JobStatus, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sync_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Processing => stats.processing = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Cancelled => stats.cancelled = count,
            }
            stats.total += count;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{file_test_pool, test_pool};
    use serde_json::json;
    use tokio::task::JoinSet;

    const MINUTE_MS: i64 = 60_000;

    async fn queue() -> SyncQueue {
        SyncQueue::new(test_pool().await)
    }

    fn points_job(client_id: i64) -> NewSyncJob {
        NewSyncJob::new(
            SyncOperation::PointsUpdate,
            client_id,
            json!({ "currentPoints": 150 }),
        )
    }

    #[test]
    fn backoff_doubles_and_caps_at_thirty_minutes() {
        let secs: Vec<u64> = (0..7).map(|n| backoff(n).as_secs()).collect();
        assert_eq!(secs, vec![60, 120, 240, 480, 960, 1800, 1800]);
        assert_eq!(backoff(1_000).as_secs(), 1800);
    }

    #[tokio::test]
    async fn enqueue_uses_defaults_and_validates_priority() {
        let q = queue().await;

        let job = q.enqueue(points_job(1)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.payload.0["currentPoints"], 150);

        let bad = q.enqueue(points_job(1).with_priority(11)).await;
        assert!(matches!(bad, Err(QueueError::InvalidPriority(11))));
    }

    #[tokio::test]
    async fn identical_jobs_are_not_collapsed() {
        let q = queue().await;
        q.enqueue(points_job(1)).await.unwrap();
        q.enqueue(points_job(1)).await.unwrap();

        assert_eq!(q.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn lease_orders_by_priority_then_age() {
        let q = queue().await;
        let low = q.enqueue(points_job(1).with_priority(2)).await.unwrap();
        let high_old = q.enqueue(points_job(2).with_priority(9)).await.unwrap();
        let high_new = q.enqueue(points_job(3).with_priority(9)).await.unwrap();

        let order: Vec<i64> = [
            q.lease_next("w").await.unwrap().unwrap(),
            q.lease_next("w").await.unwrap().unwrap(),
            q.lease_next("w").await.unwrap().unwrap(),
        ]
        .iter()
        .map(|j| j.job_id)
        .collect();

        assert_eq!(order, vec![high_old.job_id, high_new.job_id, low.job_id]);
        assert!(q.lease_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_leases_of_one_job_have_one_winner() {
        let q = SyncQueue::new(file_test_pool().await);
        q.enqueue(points_job(1)).await.unwrap();

        let mut tasks = JoinSet::new();
        for worker in 0..8 {
            let q = q.clone();
            tasks.spawn(async move { q.lease_next(&format!("worker-{worker}")).await });
        }
        let mut winners = Vec::new();
        while let Some(result) = tasks.join_next().await {
            winners.extend(result.unwrap().unwrap());
        }

        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].status, JobStatus::Processing);
        assert!(winners[0].lock_expires_at.is_some());
    }

    #[tokio::test]
    async fn parallel_workers_lease_each_job_exactly_once() {
        let q = SyncQueue::new(file_test_pool().await);
        for client_id in 0..20 {
            q.enqueue(points_job(client_id)).await.unwrap();
        }

        let mut tasks = JoinSet::new();
        for worker in 0..4 {
            let q = q.clone();
            tasks.spawn(async move {
                let worker_id = format!("worker-{worker}");
                let mut leased = Vec::new();
                while let Some(job) = q.lease_next(&worker_id).await.unwrap() {
                    leased.push(job.job_id);
                }
                leased
            });
        }
        let mut leased = Vec::new();
        while let Some(result) = tasks.join_next().await {
            leased.extend(result.unwrap());
        }

        leased.sort_unstable();
        let total = leased.len();
        leased.dedup();
        assert_eq!(total, 20);
        assert_eq!(leased.len(), 20);
        assert_eq!(q.stats().await.unwrap().processing, 20);
    }

    #[tokio::test]
    async fn lease_stamps_holder_and_five_minute_expiry() {
        let q = queue().await;
        q.enqueue(points_job(1)).await.unwrap();

        let now = now_millis();
        let job = q.lease_next_at("worker-a", now).await.unwrap().unwrap();
        assert_eq!(job.locked_by.as_deref(), Some("worker-a"));
        assert_eq!(job.locked_at, Some(now));
        assert_eq!(job.lock_expires_at, Some(now + 5 * MINUTE_MS));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let q = queue().await;
        q.enqueue(points_job(1)).await.unwrap();

        let now = now_millis();
        let first = q.lease_next_at("crashed", now).await.unwrap().unwrap();
        assert!(q.lease_next_at("other", now + MINUTE_MS).await.unwrap().is_none());

        let second = q
            .lease_next_at("other", now + 6 * MINUTE_MS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.locked_by.as_deref(), Some("other"));

        // The crashed worker no longer holds the lease.
        let late = q.mark_completed(&first, json!({})).await;
        assert!(matches!(late, Err(QueueError::LeaseLost(id)) if id == first.job_id));
    }

    #[tokio::test]
    async fn failures_back_off_then_fail_permanently() {
        let q = queue().await;
        q.enqueue(points_job(1).with_max_retries(3)).await.unwrap();

        let mut now = now_millis();
        let mut statuses = Vec::new();
        for attempt in 1..=3 {
            let job = q.lease_next_at("w", now).await.unwrap().unwrap();
            let failed = q
                .mark_failed_at(&job, "provider down", Some("HTTP_503"), now)
                .await
                .unwrap();

            assert_eq!(failed.retry_count, attempt);
            assert_eq!(failed.error_history.0.len() as i64, attempt);
            assert!(failed.locked_by.is_none());
            statuses.push(failed.status);

            if failed.status == JobStatus::Pending {
                let expected = now + backoff(attempt).as_millis() as i64;
                assert_eq!(failed.next_retry_at, Some(expected));
                // Not eligible until the delay has passed.
                assert!(q.lease_next_at("w", expected - 1).await.unwrap().is_none());
                now = expected;
            } else {
                assert!(failed.next_retry_at.is_none());
            }
        }

        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::Pending, JobStatus::Failed]
        );
        let failed = q.list_by_status(JobStatus::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error_code.as_deref(), Some("HTTP_503"));
        assert!(q.lease_next_at("w", now + 60 * MINUTE_MS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_stores_response_and_clears_lease() {
        let q = queue().await;
        q.enqueue(points_job(1)).await.unwrap();

        let job = q.lease_next("w").await.unwrap().unwrap();
        let done = q
            .mark_completed(&job, json!({ "success": true }))
            .await
            .unwrap();

        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.locked_by.is_none());
        assert!(done.completed_at.is_some());
        assert_eq!(done.response.unwrap().0["success"], true);
    }

    #[tokio::test]
    async fn only_pending_jobs_can_be_cancelled() {
        let q = queue().await;
        let pending = q.enqueue(points_job(1)).await.unwrap();
        q.enqueue(points_job(2)).await.unwrap();

        let cancelled = q.cancel(pending.job_id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let leased = q.lease_next("w").await.unwrap().unwrap();
        let result = q.cancel(leased.job_id).await;
        assert!(matches!(
            result,
            Err(QueueError::InvalidTransition {
                status: JobStatus::Processing,
                ..
            })
        ));
        assert!(matches!(q.cancel(999).await, Err(QueueError::NotFound(999))));
    }

    #[tokio::test]
    async fn failed_job_can_be_retried_by_operator() {
        let q = queue().await;
        q.enqueue(points_job(1).with_max_retries(1)).await.unwrap();

        let job = q.lease_next("w").await.unwrap().unwrap();
        let failed = q.mark_failed(&job, "boom", None).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let retried = q.retry_failed(job.job_id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 0);
        assert_eq!(retried.error_history.0.len(), 1);
        assert!(q.lease_next("w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stats_count_every_status() {
        let q = queue().await;
        for client_id in 1..=4 {
            q.enqueue(points_job(client_id)).await.unwrap();
        }
        let job = q.lease_next("w").await.unwrap().unwrap();
        q.mark_completed(&job, json!({})).await.unwrap();
        q.lease_next("w").await.unwrap().unwrap();
        let pending = q.list_by_status(JobStatus::Pending, 10).await.unwrap();
        q.cancel(pending[0].job_id).await.unwrap();

        assert_eq!(
            q.stats().await.unwrap(),
            QueueStats {
                pending: 1,
                processing: 1,
                completed: 1,
                failed: 0,
                cancelled: 1,
                total: 4,
            }
        );

        let purged = q.purge_finished(now_millis() + 1).await.unwrap();
        assert_eq!(purged, 2);
    }
}
