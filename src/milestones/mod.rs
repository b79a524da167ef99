//! Turns order, registration and visit events into point grants.
//!
//! A company-level (global) config and a branch config can both be active
//! for the same branch. They are evaluated independently and each writes its
//! own history entries tagged with its config source. A failing rule is
//! recorded in the report and does not stop the others.

use serde::Serialize;
use sqlx::{Pool, Sqlite};
use tracing::{debug, info, warn};

use crate::{
    db::{
        models::{ConfigSource, LoyaltyConfig, Order, Reason},
        now_millis, queries,
    },
    ledger::{LedgerContext, PointsLedger},
};

pub mod pure;

pub use pure::{is_first_purchase, new_milestones, order_qualifies, purchase_amount_points};

#[derive(Debug, thiserror::Error)]
pub enum EvaluationError {
    #[error("order not found: {0}")]
    OrderNotFound(i64),
    #[error("client not found: {0}")]
    ClientNotFound(i64),
    #[error("order {0} was already evaluated")]
    AlreadyEvaluated(i64),
    #[error("database error: {0}")]
    Database(String),
    #[error(transparent)]
    Ledger(#[from] crate::ledger::LedgerError),
}

impl From<anyhow::Error> for EvaluationError {
    fn from(e: anyhow::Error) -> Self {
        Self::Database(format!("{e:#}"))
    }
}

/// One rule's contribution to an evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RuleGrant {
    pub reason: Reason,
    pub source: ConfigSource,
    pub config_id: i64,
    pub points: i64,
    pub ok: bool,
    pub error: Option<String>,
    pub balance_after: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub client_id: i64,
    pub grants: Vec<RuleGrant>,
    /// Sum of the grants that were applied.
    pub total_points: i64,
}

impl EvaluationReport {
    fn new(client_id: i64) -> Self {
        Self {
            client_id,
            grants: Vec::new(),
            total_points: 0,
        }
    }

    fn failed(&mut self, config: &LoyaltyConfig, reason: Reason, error: String) {
        self.grants.push(RuleGrant {
            reason,
            source: config.source(),
            config_id: config.config_id,
            points: 0,
            ok: false,
            error: Some(error),
            balance_after: None,
        });
    }

    /// Report for an event that granted nothing.
    pub fn empty(client_id: i64) -> Self {
        Self::new(client_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RuleGrant> {
        self.grants.iter().filter(|g| !g.ok)
    }
}

#[derive(Clone)]
pub struct MilestoneEvaluator {
    pool: Pool<Sqlite>,
    ledger: PointsLedger,
}

impl MilestoneEvaluator {
    pub fn new(pool: Pool<Sqlite>, ledger: PointsLedger) -> Self {
        Self { pool, ledger }
    }

    /// Grants purchase-amount, accumulated-purchase and first-purchase points
    /// for a stored order.
    pub async fn evaluate_order(&self, order_id: i64) -> Result<EvaluationReport, EvaluationError> {
        let order = queries::get_order(&self.pool, order_id)
            .await?
            .ok_or(EvaluationError::OrderNotFound(order_id))?;

        let mut report = EvaluationReport::new(order.client_id);

        if !order_qualifies(order.advance_cents, order.sent_to_production) {
            debug!(order_id, "order has no payment signal, no points");
            return Ok(report);
        }

        if !self.claim_order(order_id).await? {
            return Err(EvaluationError::AlreadyEvaluated(order_id));
        }

        let configs =
            queries::get_active_configs(&self.pool, order.company_id, Some(order.branch_id)).await?;

        for config in &configs {
            self.evaluate_config(&order, config, &mut report).await;
        }

        info!(
            order_id,
            client_id = order.client_id,
            total_points = report.total_points,
            grants = report.grants.len(),
            failed = report.failures().count(),
            "order evaluated"
        );

        Ok(report)
    }

    async fn evaluate_config(&self, order: &Order, config: &LoyaltyConfig, report: &mut EvaluationReport) {
        let ctx = LedgerContext {
            order_id: Some(order.order_id),
            config_source: config.source(),
            branch_id: Some(order.branch_id),
            company_id: Some(order.company_id),
            actor_id: None,
            description: None,
        };

        if config.purchase_amount_enabled {
            let points = purchase_amount_points(
                order.total_cents,
                config.purchase_threshold_cents,
                config.points_per_threshold,
            );
            if points > 0 {
                self.grant(report, config, order.client_id, points, Reason::PurchaseAmount, &ctx)
                    .await;
            }
        }

        let needs_count = config.accumulated_enabled || config.first_purchase_enabled;
        if !needs_count {
            return;
        }

        // Branch configs count orders at their branch only; global configs
        // count every branch of the company.
        let qualifying = match queries::count_qualifying_orders(
            &self.pool,
            order.client_id,
            order.company_id,
            config.branch_id,
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(order_id = order.order_id, error = %e, "failed to count qualifying orders");
                if config.accumulated_enabled {
                    report.failed(config, Reason::AccumulatedPurchases, e.to_string());
                }
                if config.first_purchase_enabled {
                    report.failed(config, Reason::FirstPurchase, e.to_string());
                }
                return;
            }
        };

        if config.accumulated_enabled && config.points_per_milestone > 0 {
            match self
                .ledger
                .count_entries(
                    order.client_id,
                    Reason::AccumulatedPurchases,
                    config.source(),
                    order.company_id,
                    config.branch_id,
                )
                .await
            {
                Ok(rewarded) => {
                    let fresh = new_milestones(qualifying, config.purchases_required, rewarded);
                    for _ in 0..fresh {
                        self.grant(
                            report,
                            config,
                            order.client_id,
                            config.points_per_milestone,
                            Reason::AccumulatedPurchases,
                            &ctx,
                        )
                        .await;
                    }
                }
                Err(e) => report.failed(config, Reason::AccumulatedPurchases, e.to_string()),
            }
        }

        if config.first_purchase_enabled
            && config.first_purchase_points > 0
            && is_first_purchase(qualifying)
        {
            self.grant(
                report,
                config,
                order.client_id,
                config.first_purchase_points,
                Reason::FirstPurchase,
                &ctx,
            )
            .await;
        }
    }

    /// Registration bonus from every enabled config, at most once per config.
    pub async fn evaluate_registration(&self, client_id: i64) -> Result<EvaluationReport, EvaluationError> {
        let client = queries::get_client(&self.pool, client_id)
            .await?
            .ok_or(EvaluationError::ClientNotFound(client_id))?;

        let mut report = EvaluationReport::new(client_id);
        let configs = queries::get_active_configs(&self.pool, client.company_id, client.branch_id).await?;

        for config in configs
            .iter()
            .filter(|c| c.registration_enabled && c.registration_points > 0)
        {
            let already = self
                .ledger
                .count_entries(
                    client_id,
                    Reason::ClientRegistration,
                    config.source(),
                    client.company_id,
                    config.branch_id,
                )
                .await?;
            if already > 0 {
                continue;
            }

            let ctx = LedgerContext {
                config_source: config.source(),
                branch_id: client.branch_id,
                company_id: Some(client.company_id),
                ..Default::default()
            };
            self.grant(
                &mut report,
                config,
                client_id,
                config.registration_points,
                Reason::ClientRegistration,
                &ctx,
            )
            .await;
        }

        Ok(report)
    }

    /// Visit points for a card scanned at a branch.
    pub async fn evaluate_visit(
        &self,
        client_id: i64,
        branch_id: i64,
    ) -> Result<EvaluationReport, EvaluationError> {
        let client = queries::get_client(&self.pool, client_id)
            .await?
            .ok_or(EvaluationError::ClientNotFound(client_id))?;

        let mut report = EvaluationReport::new(client_id);
        let configs = queries::get_active_configs(&self.pool, client.company_id, Some(branch_id)).await?;

        for config in configs.iter().filter(|c| c.visit_points > 0) {
            let ctx = LedgerContext {
                config_source: config.source(),
                branch_id: Some(branch_id),
                company_id: Some(client.company_id),
                ..Default::default()
            };
            self.grant(
                &mut report,
                config,
                client_id,
                config.visit_points,
                Reason::BranchVisit,
                &ctx,
            )
            .await;
        }

        Ok(report)
    }

    /// Marks the order as evaluated. Only the first caller gets `true`, so
    /// concurrent evaluations of one order grant once.
    async fn claim_order(&self, order_id: i64) -> Result<bool, EvaluationError> {
        let claimed = sqlx::query(
            "INSERT INTO order_evaluations (order_id, evaluated_at) VALUES (?, ?)
             ON CONFLICT (order_id) DO NOTHING",
        )
        .bind(order_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| EvaluationError::Database(e.to_string()))?;

        Ok(claimed.rows_affected() == 1)
    }

    async fn grant(
        &self,
        report: &mut EvaluationReport,
        config: &LoyaltyConfig,
        client_id: i64,
        points: i64,
        reason: Reason,
        ctx: &LedgerContext,
    ) {
        match self.ledger.apply_delta(client_id, points, reason, ctx).await {
            Ok(applied) => {
                report.total_points += points;
                report.grants.push(RuleGrant {
                    reason,
                    source: config.source(),
                    config_id: config.config_id,
                    points,
                    ok: true,
                    error: None,
                    balance_after: Some(applied.balance_after),
                });
            }
            Err(e) => {
                warn!(client_id, reason = ?reason, error = %e, "points grant failed");
                report.failed(config, reason, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        file_test_pool,
        models::{CreateClientRequest, CreateOrderRequest},
        test_pool,
    };

    struct Fixture {
        pool: Pool<Sqlite>,
        ledger: PointsLedger,
        evaluator: MilestoneEvaluator,
        client_id: i64,
    }

    async fn fixture(configs: &[LoyaltyConfig]) -> Fixture {
        fixture_on(test_pool().await, configs).await
    }

    async fn fixture_on(pool: Pool<Sqlite>, configs: &[LoyaltyConfig]) -> Fixture {
        for config in configs {
            queries::upsert_config(&pool, config).await.unwrap();
        }
        let client = queries::insert_client(
            &pool,
            &CreateClientRequest {
                company_id: 1,
                branch_id: Some(10),
                client_number: "C-0001".to_string(),
                name: "Ana".to_string(),
            },
        )
        .await
        .unwrap();
        let ledger = PointsLedger::new(pool.clone());
        let evaluator = MilestoneEvaluator::new(pool.clone(), ledger.clone());
        Fixture {
            pool,
            ledger,
            evaluator,
            client_id: client.client_id,
        }
    }

    fn branch_config() -> LoyaltyConfig {
        LoyaltyConfig {
            company_id: 1,
            branch_id: Some(10),
            enabled: true,
            ..Default::default()
        }
    }

    fn global_config() -> LoyaltyConfig {
        LoyaltyConfig {
            company_id: 1,
            branch_id: None,
            enabled: true,
            ..Default::default()
        }
    }

    async fn place_order(f: &Fixture, branch_id: i64, total_cents: i64, advance_cents: i64) -> i64 {
        queries::insert_order(
            &f.pool,
            &CreateOrderRequest {
                client_id: f.client_id,
                company_id: 1,
                branch_id,
                total_cents,
                advance_cents,
                sent_to_production: false,
            },
        )
        .await
        .unwrap()
        .order_id
    }

    #[tokio::test]
    async fn accumulated_milestone_is_granted_once_per_crossing() {
        let f = fixture(&[LoyaltyConfig {
            accumulated_enabled: true,
            purchases_required: 5,
            points_per_milestone: 50,
            ..branch_config()
        }])
        .await;

        let mut balances = Vec::new();
        for _ in 0..10 {
            let order_id = place_order(&f, 10, 1_000, 500).await;
            f.evaluator.evaluate_order(order_id).await.unwrap();
            balances.push(f.ledger.balance(f.client_id).await.unwrap());
        }

        assert_eq!(balances, vec![0, 0, 0, 0, 50, 50, 50, 50, 50, 100]);
    }

    #[tokio::test]
    async fn order_without_payment_signal_earns_nothing() {
        let f = fixture(&[LoyaltyConfig {
            purchase_amount_enabled: true,
            purchase_threshold_cents: 1_000,
            points_per_threshold: 1,
            ..branch_config()
        }])
        .await;

        let order_id = place_order(&f, 10, 50_000, 0).await;
        let report = f.evaluator.evaluate_order(order_id).await.unwrap();

        assert!(report.grants.is_empty());
        assert_eq!(report.total_points, 0);
        assert_eq!(f.ledger.balance(f.client_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn global_and_branch_configs_grant_independently() {
        let purchase = |c: LoyaltyConfig, per| LoyaltyConfig {
            purchase_amount_enabled: true,
            purchase_threshold_cents: 10_000,
            points_per_threshold: per,
            ..c
        };
        let f = fixture(&[purchase(global_config(), 1), purchase(branch_config(), 5)]).await;

        let order_id = place_order(&f, 10, 25_000, 25_000).await;
        let report = f.evaluator.evaluate_order(order_id).await.unwrap();

        assert_eq!(report.total_points, 12);
        let sources: Vec<_> = report.grants.iter().map(|g| (g.source, g.points)).collect();
        assert_eq!(sources, vec![(ConfigSource::Global, 2), (ConfigSource::Branch, 10)]);
    }

    #[tokio::test]
    async fn global_scope_counts_orders_across_branches() {
        let f = fixture(&[LoyaltyConfig {
            accumulated_enabled: true,
            purchases_required: 2,
            points_per_milestone: 20,
            ..global_config()
        }])
        .await;

        let first = place_order(&f, 10, 1_000, 100).await;
        f.evaluator.evaluate_order(first).await.unwrap();
        let second = place_order(&f, 20, 1_000, 100).await;
        let report = f.evaluator.evaluate_order(second).await.unwrap();

        assert_eq!(report.total_points, 20);
        assert_eq!(report.grants[0].source, ConfigSource::Global);
    }

    #[tokio::test]
    async fn first_purchase_bonus_only_on_first_order() {
        let f = fixture(&[LoyaltyConfig {
            first_purchase_enabled: true,
            first_purchase_points: 30,
            ..branch_config()
        }])
        .await;

        let first = place_order(&f, 10, 1_000, 100).await;
        let report = f.evaluator.evaluate_order(first).await.unwrap();
        assert_eq!(report.total_points, 30);
        assert_eq!(report.grants[0].reason, Reason::FirstPurchase);

        let second = place_order(&f, 10, 1_000, 100).await;
        let report = f.evaluator.evaluate_order(second).await.unwrap();
        assert_eq!(report.total_points, 0);
    }

    #[tokio::test]
    async fn order_is_evaluated_once() {
        let f = fixture(&[LoyaltyConfig {
            purchase_amount_enabled: true,
            purchase_threshold_cents: 1_000,
            points_per_threshold: 1,
            ..branch_config()
        }])
        .await;

        let order_id = place_order(&f, 10, 5_000, 5_000).await;
        f.evaluator.evaluate_order(order_id).await.unwrap();
        let again = f.evaluator.evaluate_order(order_id).await;

        assert!(matches!(again, Err(EvaluationError::AlreadyEvaluated(id)) if id == order_id));
        assert_eq!(f.ledger.balance(f.client_id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn concurrent_evaluations_of_one_order_grant_once() {
        let f = fixture_on(
            file_test_pool().await,
            &[LoyaltyConfig {
                purchase_amount_enabled: true,
                purchase_threshold_cents: 1_000,
                points_per_threshold: 1,
                first_purchase_enabled: true,
                first_purchase_points: 30,
                ..branch_config()
            }],
        )
        .await;
        let order_id = place_order(&f, 10, 5_000, 5_000).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let evaluator = f.evaluator.clone();
            tasks.spawn(async move { evaluator.evaluate_order(order_id).await });
        }
        let (mut granted, mut refused) = (0, 0);
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(report) => {
                    assert_eq!(report.total_points, 35);
                    granted += 1;
                }
                Err(EvaluationError::AlreadyEvaluated(id)) => {
                    assert_eq!(id, order_id);
                    refused += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!((granted, refused), (1, 5));
        assert_eq!(f.ledger.balance(f.client_id).await.unwrap(), 35);
    }

    #[tokio::test]
    async fn order_paid_later_is_evaluated_once_paid() {
        let f = fixture(&[LoyaltyConfig {
            purchase_amount_enabled: true,
            purchase_threshold_cents: 1_000,
            points_per_threshold: 2,
            ..branch_config()
        }])
        .await;

        let order_id = place_order(&f, 10, 4_000, 0).await;
        assert_eq!(f.evaluator.evaluate_order(order_id).await.unwrap().total_points, 0);

        queries::update_order_payment(&f.pool, order_id, Some(1_000), None)
            .await
            .unwrap()
            .unwrap();
        let report = f.evaluator.evaluate_order(order_id).await.unwrap();

        assert_eq!(report.total_points, 8);
        assert_eq!(f.ledger.balance(f.client_id).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn registration_bonus_per_config_and_only_once() {
        let registration = |c: LoyaltyConfig, points| LoyaltyConfig {
            registration_enabled: true,
            registration_points: points,
            ..c
        };
        let f = fixture(&[
            registration(global_config(), 100),
            registration(branch_config(), 25),
        ])
        .await;

        let report = f.evaluator.evaluate_registration(f.client_id).await.unwrap();
        assert_eq!(report.total_points, 125);
        assert_eq!(report.grants.len(), 2);

        let report = f.evaluator.evaluate_registration(f.client_id).await.unwrap();
        assert_eq!(report.total_points, 0);
        assert_eq!(f.ledger.balance(f.client_id).await.unwrap(), 125);
    }

    #[tokio::test]
    async fn missing_order_is_not_found() {
        let f = fixture(&[]).await;
        let result = f.evaluator.evaluate_order(42).await;
        assert!(matches!(result, Err(EvaluationError::OrderNotFound(42))));
    }
}
