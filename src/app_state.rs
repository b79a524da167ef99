use sqlx::{Pool, Sqlite};
use std::sync::Arc;

use crate::{
    config::Config,
    credential::{CredentialCodec, RandomIv},
    ledger::PointsLedger,
    milestones::MilestoneEvaluator,
    queue::SyncQueue,
};

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<Sqlite>,
    pub ledger: PointsLedger,
    pub evaluator: MilestoneEvaluator,
    pub codec: Arc<CredentialCodec>,
    pub queue: SyncQueue,
}

impl AppState {
    pub fn new(pool: Pool<Sqlite>, config: &Config) -> Self {
        let ledger = PointsLedger::new(pool.clone());
        let evaluator = MilestoneEvaluator::new(pool.clone(), ledger.clone());

        let mut codec = CredentialCodec::new(&config.credential_secret)
            .with_validity(chrono::Duration::days(config.card_validity_days));
        if config.credential_random_iv {
            codec = codec.with_iv_source(Arc::new(RandomIv));
        }

        Self {
            queue: SyncQueue::new(pool.clone()),
            pool,
            ledger,
            evaluator,
            codec: Arc::new(codec),
        }
    }
}
