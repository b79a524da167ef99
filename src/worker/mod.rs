//! Background worker that drains the sync queue into the wallet provider.

use serde::Serialize;
use serde_json::{Value, json};
use sqlx::{Pool, Sqlite};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    credential::CardIdentity,
    db::{
        models::{CardLink, CardLinkStatus, SyncJob, SyncOperation},
        queries,
    },
    provider::{LoyaltyProvider, ProviderError, RegisterCardRequest, TransactionContext},
    queue::{NewSyncJob, QueueError, SyncQueue},
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Jobs leased and run concurrently per round.
    pub batch_size: usize,
    /// Sleep between rounds when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "sync-worker".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Why a single job attempt failed. Stored on the job via `mark_failed`.
#[derive(Debug, thiserror::Error)]
enum JobFailure {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("card link {0} not found")]
    CardLinkNotFound(i64),
    #[error("sync job has no card link")]
    CardLinkMissing,
    #[error("client {0} not found")]
    ClientNotFound(i64),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for JobFailure {
    fn from(e: anyhow::Error) -> Self {
        JobFailure::Database(e.to_string())
    }
}

impl JobFailure {
    fn code(&self) -> String {
        match self {
            JobFailure::Provider(e) => e.code(),
            JobFailure::CardLinkNotFound(_) | JobFailure::CardLinkMissing => {
                "CARD_LINK_NOT_FOUND".to_string()
            }
            JobFailure::ClientNotFound(_) => "CLIENT_NOT_FOUND".to_string(),
            JobFailure::InvalidPayload(_) => "INVALID_PAYLOAD".to_string(),
            JobFailure::Database(_) => "DATABASE_ERROR".to_string(),
        }
    }
}

/// Leases jobs in batches and runs them against the provider.
///
/// Several workers (in one process or many) may share a queue; the lease is
/// the only coordination between them.
#[derive(Clone)]
pub struct SyncWorker {
    queue: SyncQueue,
    provider: Arc<dyn LoyaltyProvider>,
    pool: Pool<Sqlite>,
    config: WorkerConfig,
    counters: Arc<Counters>,
}

impl SyncWorker {
    pub fn new(
        pool: Pool<Sqlite>,
        queue: SyncQueue,
        provider: Arc<dyn LoyaltyProvider>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            provider,
            pool,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Runs until `shutdown` flips to `true` or its sender is dropped. The
    /// batch in flight is always finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker = %self.config.worker_id,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "sync worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(count) => count == 0,
                Err(e) => {
                    error!(worker = %self.config.worker_id, error = %e, "failed to lease sync jobs");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            worker = %self.config.worker_id,
            processed = stats.jobs_processed,
            succeeded = stats.jobs_succeeded,
            failed = stats.jobs_failed,
            "sync worker stopped"
        );
    }

    /// Leases up to `batch_size` jobs, runs them concurrently and waits for
    /// all of them. Returns how many jobs were run.
    pub async fn run_once(&self) -> Result<usize, QueueError> {
        let mut tasks = JoinSet::new();

        for _ in 0..self.config.batch_size.max(1) {
            let Some(job) = self.queue.lease_next(&self.config.worker_id).await? else {
                break;
            };
            let worker = self.clone();
            tasks.spawn(async move { worker.execute(job).await });
        }

        let mut count = 0;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(worker = %self.config.worker_id, error = %e, "sync task panicked");
            }
            count += 1;
        }

        Ok(count)
    }

    /// Runs one leased job and records the outcome on the queue.
    pub async fn execute(&self, job: SyncJob) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            job_id = job.job_id,
            operation = %job.operation,
            client_id = job.client_id,
            attempt = job.retry_count + 1,
            "running sync job"
        );

        let recorded = match self.dispatch(&job).await {
            Ok(response) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                self.queue.mark_completed(&job, response).await
            }
            Err(failure) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = job.job_id,
                    operation = %job.operation,
                    error = %failure,
                    "sync job attempt failed"
                );
                self.queue
                    .mark_failed(&job, &failure.to_string(), Some(&failure.code()))
                    .await
            }
        };

        if let Err(e) = recorded {
            error!(job_id = job.job_id, error = %e, "failed to record sync job outcome");
        }
    }

    async fn dispatch(&self, job: &SyncJob) -> Result<Value, JobFailure> {
        match job.operation {
            SyncOperation::PointsUpdate => self.points_update(job).await,
            SyncOperation::CardRegister => self.card_register(job).await,
            SyncOperation::CardDeactivate => {
                let link = self.card_link(job).await?;
                let response = self.provider.deactivate_card(&link.remote_card_id).await?;
                queries::set_card_link_status(&self.pool, link.link_id, CardLinkStatus::Inactive)
                    .await?;
                Ok(response)
            }
            SyncOperation::RewardRedeem => {
                let link = self.card_link(job).await?;
                let points = payload_i64(job, "points")?;
                let tx = transaction_context(job);
                Ok(self
                    .provider
                    .redeem_points(&link.remote_card_id, points, &tx)
                    .await?)
            }
            SyncOperation::TierUpdate => {
                let link = self.card_link(job).await?;
                let tier = job.payload.0["tier"]
                    .as_str()
                    .ok_or_else(|| JobFailure::InvalidPayload("missing tier".to_string()))?;
                let response = self.provider.update_tier(&link.remote_card_id, tier).await?;
                queries::set_card_link_tier(&self.pool, link.link_id, tier).await?;
                Ok(response)
            }
            SyncOperation::ProfileUpdate => {
                let link = self.card_link(job).await?;
                Ok(self
                    .provider
                    .update_profile(&link.remote_card_id, &job.payload.0)
                    .await?)
            }
        }
    }

    async fn points_update(&self, job: &SyncJob) -> Result<Value, JobFailure> {
        let link = self.card_link(job).await?;
        if link.status != CardLinkStatus::Active {
            debug!(job_id = job.job_id, link_id = link.link_id, "card link no longer active");
            return Ok(json!({ "skipped": "card link not active" }));
        }

        // The ledger is authoritative. `currentPoints` is the balance when the
        // job was queued and may be stale by the time a retry runs.
        let balance = self.ledger_balance(job.client_id).await?;
        let queued = job.payload.0.get("currentPoints").and_then(Value::as_i64);
        if queued.is_some_and(|queued| queued != balance) {
            debug!(job_id = job.job_id, ?queued, balance, "ledger moved since the job was queued");
        }

        let tx = transaction_context(job);
        let response = self
            .provider
            .update_points(&link.remote_card_id, balance, &tx)
            .await?;
        queries::mark_card_synced(&self.pool, link.link_id, balance).await?;

        // A change that landed while the call was in flight needs another round.
        let latest = self.ledger_balance(job.client_id).await?;
        if latest != balance {
            self.requeue_points(job, &link, latest).await;
        }

        Ok(response)
    }

    async fn ledger_balance(&self, client_id: i64) -> Result<i64, JobFailure> {
        Ok(queries::get_client(&self.pool, client_id)
            .await?
            .ok_or(JobFailure::ClientNotFound(client_id))?
            .points_balance)
    }

    async fn requeue_points(&self, job: &SyncJob, link: &CardLink, balance: i64) {
        let follow_up = NewSyncJob::new(
            SyncOperation::PointsUpdate,
            job.client_id,
            json!({ "currentPoints": balance }),
        )
        .with_card_link(link.link_id)
        .with_branch(link.branch_id)
        .with_order(job.order_id);

        match self.queue.enqueue(follow_up).await {
            Ok(next) => debug!(
                job_id = job.job_id,
                next_job_id = next.job_id,
                balance,
                "balance moved during sync"
            ),
            Err(e) => warn!(job_id = job.job_id, error = %e, "failed to queue follow-up points sync"),
        }
    }

    async fn card_register(&self, job: &SyncJob) -> Result<Value, JobFailure> {
        let client = queries::get_client(&self.pool, job.client_id)
            .await?
            .ok_or(JobFailure::ClientNotFound(job.client_id))?;

        let payload = &job.payload.0;
        let identity = CardIdentity {
            client_id: client.client_id,
            client_number: client.client_number.clone(),
            pass_serial_number: payload["passSerialNumber"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(CardIdentity::generate_serial),
            company_id: client.company_id,
        };
        let req = RegisterCardRequest {
            identity,
            display_name: payload["displayName"]
                .as_str()
                .map(String::from)
                .or_else(|| Some(client.name.clone())),
            initial_points: client.points_balance,
        };

        let card = self.provider.register_card(&req).await?;
        let link = queries::activate_card_link(
            &self.pool,
            client.client_id,
            job.branch_id,
            &card.remote_card_id,
            card.remote_pass_id.as_deref(),
            card.qr_code.as_deref(),
            client.points_balance,
        )
        .await?;

        info!(
            job_id = job.job_id,
            client_id = client.client_id,
            link_id = link.link_id,
            remote_card_id = %link.remote_card_id,
            "card registered with provider"
        );

        Ok(json!({
            "linkId": link.link_id,
            "remoteCardId": link.remote_card_id,
            "remotePassId": link.remote_pass_id,
        }))
    }

    async fn card_link(&self, job: &SyncJob) -> Result<CardLink, JobFailure> {
        let link_id = job.card_link_id.ok_or(JobFailure::CardLinkMissing)?;
        queries::get_card_link(&self.pool, link_id)
            .await?
            .ok_or(JobFailure::CardLinkNotFound(link_id))
    }
}

fn payload_i64(job: &SyncJob, field: &str) -> Result<i64, JobFailure> {
    job.payload.0[field]
        .as_i64()
        .ok_or_else(|| JobFailure::InvalidPayload(format!("missing or non-integer {field}")))
}

fn transaction_context(job: &SyncJob) -> TransactionContext {
    TransactionContext {
        reference: format!("sync-job-{}", job.job_id),
        reason: job.payload.0["reason"].as_str().map(String::from),
        order_id: job.order_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{
            models::{CreateClientRequest, JobStatus, Reason},
            now_millis, test_pool,
        },
        ledger::{LedgerContext, PointsLedger},
        provider::{MockProvider, ProviderCall},
    };

    struct Harness {
        pool: Pool<Sqlite>,
        queue: SyncQueue,
        provider: Arc<MockProvider>,
        worker: SyncWorker,
        client_id: i64,
    }

    async fn harness(batch_size: usize) -> Harness {
        let pool = test_pool().await;
        let client = queries::insert_client(
            &pool,
            &CreateClientRequest {
                company_id: 1,
                branch_id: Some(7),
                client_number: "C-0001".to_string(),
                name: "Ada".to_string(),
            },
        )
        .await
        .unwrap();

        let queue = SyncQueue::new(pool.clone());
        let provider = Arc::new(MockProvider::new());
        let worker = SyncWorker::new(
            pool.clone(),
            queue.clone(),
            provider.clone(),
            WorkerConfig {
                worker_id: "test-worker".to_string(),
                batch_size,
                poll_interval: Duration::from_millis(10),
            },
        );

        Harness {
            pool,
            queue,
            provider,
            worker,
            client_id: client.client_id,
        }
    }

    async fn linked_card(h: &Harness) -> CardLink {
        queries::activate_card_link(&h.pool, h.client_id, None, "card-1", None, None, 0)
            .await
            .unwrap()
    }

    fn points_job(client_id: i64, link_id: i64, points: i64) -> NewSyncJob {
        NewSyncJob::new(
            SyncOperation::PointsUpdate,
            client_id,
            json!({ "currentPoints": points }),
        )
        .with_card_link(link_id)
    }

    #[tokio::test]
    async fn points_update_advances_sync_watermark() {
        let h = harness(10).await;
        let link = linked_card(&h).await;
        PointsLedger::new(h.pool.clone())
            .apply_delta(h.client_id, 150, Reason::ManualAdjustment, &LedgerContext::default())
            .await
            .unwrap();
        let job = h
            .queue
            .enqueue(points_job(h.client_id, link.link_id, 150))
            .await
            .unwrap();

        assert_eq!(h.worker.run_once().await.unwrap(), 1);

        let link = queries::get_card_link(&h.pool, link.link_id).await.unwrap().unwrap();
        assert_eq!(link.last_synced_points, 150);
        assert!(!link.needs_sync(150));
        assert_eq!(h.queue.get(job.job_id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(
            h.provider.calls(),
            vec![ProviderCall::UpdatePoints {
                remote_card_id: "card-1".to_string(),
                balance: 150,
            }]
        );
    }

    #[tokio::test]
    async fn provider_failure_is_retried_later() {
        let h = harness(10).await;
        let link = linked_card(&h).await;
        PointsLedger::new(h.pool.clone())
            .apply_delta(h.client_id, 40, Reason::ManualAdjustment, &LedgerContext::default())
            .await
            .unwrap();
        let job = h
            .queue
            .enqueue(points_job(h.client_id, link.link_id, 40))
            .await
            .unwrap();
        h.provider.fail_next(1);

        h.worker.run_once().await.unwrap();

        let failed = h.queue.get(job.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error_code.as_deref(), Some("SERVICE_UNAVAILABLE"));
        let unsynced = queries::get_card_link(&h.pool, link.link_id).await.unwrap().unwrap();
        assert!(unsynced.needs_sync(40));

        // Still backing off.
        assert_eq!(h.worker.run_once().await.unwrap(), 0);

        let leased = h
            .queue
            .lease_next_at("test-worker", now_millis() + 3 * 60_000)
            .await
            .unwrap()
            .unwrap();
        h.worker.execute(leased).await;

        assert_eq!(h.queue.get(job.job_id).await.unwrap().status, JobStatus::Completed);
        let synced = queries::get_card_link(&h.pool, link.link_id).await.unwrap().unwrap();
        assert_eq!(synced.last_synced_points, 40);
        assert_eq!(
            h.worker.stats(),
            WorkerStats {
                jobs_processed: 2,
                jobs_succeeded: 1,
                jobs_failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn missing_card_link_fails_the_attempt() {
        let h = harness(10).await;
        let job = h
            .queue
            .enqueue(points_job(h.client_id, 999, 10))
            .await
            .unwrap();

        h.worker.run_once().await.unwrap();

        let failed = h.queue.get(job.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Pending);
        assert_eq!(failed.last_error_code.as_deref(), Some("CARD_LINK_NOT_FOUND"));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn card_register_creates_active_link() {
        let h = harness(10).await;
        h.queue
            .enqueue(
                NewSyncJob::new(
                    SyncOperation::CardRegister,
                    h.client_id,
                    json!({ "passSerialNumber": "SERIAL1" }),
                )
                .with_branch(Some(7)),
            )
            .await
            .unwrap();

        h.worker.run_once().await.unwrap();

        let link = queries::get_active_card_link(&h.pool, h.client_id, Some(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.remote_card_id, "luyoa-card-SERIAL1");
        assert_eq!(link.status, CardLinkStatus::Active);
        assert_eq!(link.last_synced_points, 0);
    }

    #[tokio::test]
    async fn tier_update_and_deactivate_touch_the_link() {
        let h = harness(1).await;
        let link = linked_card(&h).await;
        h.queue
            .enqueue(
                NewSyncJob::new(SyncOperation::TierUpdate, h.client_id, json!({ "tier": "gold" }))
                    .with_card_link(link.link_id)
                    .with_priority(9),
            )
            .await
            .unwrap();
        h.queue
            .enqueue(
                NewSyncJob::new(SyncOperation::CardDeactivate, h.client_id, json!({}))
                    .with_card_link(link.link_id),
            )
            .await
            .unwrap();

        assert_eq!(h.worker.run_once().await.unwrap(), 1);
        assert_eq!(h.worker.run_once().await.unwrap(), 1);

        let link = queries::get_card_link(&h.pool, link.link_id).await.unwrap().unwrap();
        assert_eq!(link.remote_tier.as_deref(), Some("gold"));
        assert_eq!(link.status, CardLinkStatus::Inactive);
    }

    #[tokio::test]
    async fn stale_retry_sends_current_balance() {
        let h = harness(10).await;
        let link = linked_card(&h).await;
        let ledger = PointsLedger::new(h.pool.clone());
        let ctx = LedgerContext::default();

        ledger
            .apply_delta(h.client_id, 100, Reason::ManualAdjustment, &ctx)
            .await
            .unwrap();
        let older = h
            .queue
            .enqueue(points_job(h.client_id, link.link_id, 100))
            .await
            .unwrap();
        h.provider.fail_next(1);
        h.worker.run_once().await.unwrap();
        assert_eq!(h.queue.get(older.job_id).await.unwrap().status, JobStatus::Pending);

        ledger
            .apply_delta(h.client_id, 50, Reason::ManualAdjustment, &ctx)
            .await
            .unwrap();
        let newer = h
            .queue
            .enqueue(points_job(h.client_id, link.link_id, 150))
            .await
            .unwrap();
        assert_eq!(h.worker.run_once().await.unwrap(), 1);
        assert_eq!(h.queue.get(newer.job_id).await.unwrap().status, JobStatus::Completed);

        // The older job comes back after its backoff, carrying 100.
        let retried = h
            .queue
            .lease_next_at("test-worker", now_millis() + 3 * 60_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.job_id, older.job_id);
        h.worker.execute(retried).await;

        let last_sent = h.provider.calls().into_iter().last().unwrap();
        assert_eq!(
            last_sent,
            ProviderCall::UpdatePoints {
                remote_card_id: "card-1".to_string(),
                balance: 150,
            }
        );
        let link = queries::get_card_link(&h.pool, link.link_id).await.unwrap().unwrap();
        assert_eq!(link.last_synced_points, 150);
        assert_eq!(h.queue.get(older.job_id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(h.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn batch_is_bounded_by_batch_size() {
        let h = harness(2).await;
        let link = linked_card(&h).await;
        for points in [10, 20, 30] {
            h.queue
                .enqueue(points_job(h.client_id, link.link_id, points))
                .await
                .unwrap();
        }

        assert_eq!(h.worker.run_once().await.unwrap(), 2);
        assert_eq!(h.worker.run_once().await.unwrap(), 1);
        assert_eq!(h.queue.stats().await.unwrap().completed, 3);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_signal() {
        let h = harness(10).await;
        let link = linked_card(&h).await;
        h.queue
            .enqueue(points_job(h.client_id, link.link_id, 5))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker.clone().run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.queue.stats().await.unwrap().completed, 1);
    }
}
