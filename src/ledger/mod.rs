//! Client point balances and their append-only history.
//!
//! The ledger is the only writer of `clients.points_balance`. Every mutation
//! lands together with a `points_history` row in one transaction that takes
//! the write lock before reading the balance, so concurrent deltas for the
//! same client queue up behind each other instead of interleaving.

use serde::{Deserialize, Serialize};
use sqlx::{Pool, QueryBuilder, Sqlite};
use tracing::debug;

use crate::db::{
    models::{ConfigSource, EntryType, PointsHistoryEntry, Reason},
    now_millis,
};

const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("client not found: {0}")]
    ClientNotFound(i64),
    #[error("points amount must not be zero")]
    ZeroAmount,
    #[error("invalid points amount: {0}")]
    InvalidAmount(i64),
    #[error("insufficient points: balance {balance}, requested {requested}")]
    InsufficientPoints { balance: i64, requested: i64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Where a delta comes from and who caused it.
#[derive(Debug, Clone)]
pub struct LedgerContext {
    pub order_id: Option<i64>,
    pub config_source: ConfigSource,
    pub branch_id: Option<i64>,
    pub company_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub description: Option<String>,
}

impl Default for LedgerContext {
    fn default() -> Self {
        Self {
            order_id: None,
            config_source: ConfigSource::Manual,
            branch_id: None,
            company_id: None,
            actor_id: None,
            description: None,
        }
    }
}

impl LedgerContext {
    pub fn manual(actor_id: Option<i64>) -> Self {
        Self {
            actor_id,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of a successful [`PointsLedger::apply_delta`].
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub balance_before: i64,
    pub balance_after: i64,
    pub entry: PointsHistoryEntry,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryFilter {
    pub entry_type: Option<EntryType>,
    pub reason: Option<Reason>,
    pub config_source: Option<ConfigSource>,
    pub branch_id: Option<i64>,
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageRequest {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
        }
    }
}

impl PageRequest {
    fn limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_LIMIT)
    }

    fn offset(&self) -> u32 {
        (self.page.max(1) - 1).saturating_mul(self.limit())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

#[derive(Clone)]
pub struct PointsLedger {
    pool: Pool<Sqlite>,
}

impl PointsLedger {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn balance(&self, client_id: i64) -> Result<i64, LedgerError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT points_balance FROM clients WHERE client_id = ?")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(balance,)| balance)
            .ok_or(LedgerError::ClientNotFound(client_id))
    }

    /// Adds `points` (negative to deduct) to the client's balance, flooring the
    /// result at zero, and appends the matching history entry.
    ///
    /// Over-deduction is not rejected here: the entry keeps the requested
    /// amount while the balance stops at zero. Use [`PointsLedger::redeem`]
    /// for a checked deduction.
    pub async fn apply_delta(
        &self,
        client_id: i64,
        points: i64,
        reason: Reason,
        ctx: &LedgerContext,
    ) -> Result<LedgerEntry, LedgerError> {
        if points == 0 {
            return Err(LedgerError::ZeroAmount);
        }

        self.write_delta(client_id, points, reason, ctx, false).await
    }

    /// Deducts `points` after checking the balance covers them.
    pub async fn redeem(
        &self,
        client_id: i64,
        points: i64,
        ctx: &LedgerContext,
    ) -> Result<LedgerEntry, LedgerError> {
        if points == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if points < 0 {
            return Err(LedgerError::InvalidAmount(points));
        }

        self.write_delta(client_id, -points, Reason::Redemption, ctx, true)
            .await
    }

    async fn write_delta(
        &self,
        client_id: i64,
        points: i64,
        reason: Reason,
        ctx: &LedgerContext,
        require_cover: bool,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry_type = if points > 0 {
            EntryType::Earned
        } else {
            EntryType::Redeemed
        };
        let now = now_millis();

        let mut tx = self.pool.begin().await?;

        // The first statement is a write, so the transaction holds the
        // database write lock before it reads the balance. Concurrent writers
        // wait on the busy timeout instead of failing on a stale snapshot.
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE clients SET updated_at = ? WHERE client_id = ? RETURNING points_balance",
        )
        .bind(now)
        .bind(client_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((balance_before,)) = row else {
            return Err(LedgerError::ClientNotFound(client_id));
        };

        if require_cover && balance_before < -points {
            return Err(LedgerError::InsufficientPoints {
                balance: balance_before,
                requested: -points,
            });
        }

        let balance_after = balance_before.saturating_add(points).max(0);

        sqlx::query("UPDATE clients SET points_balance = ? WHERE client_id = ?")
            .bind(balance_after)
            .bind(client_id)
            .execute(&mut *tx)
            .await?;

        let entry = sqlx::query_as::<_, PointsHistoryEntry>(
            "INSERT INTO points_history (client_id, order_id, points, entry_type, reason,
             config_source, balance_before, balance_after, branch_id, company_id, actor_id,
             description, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING *",
        )
        .bind(client_id)
        .bind(ctx.order_id)
        .bind(points)
        .bind(entry_type)
        .bind(reason)
        .bind(ctx.config_source)
        .bind(balance_before)
        .bind(balance_after)
        .bind(ctx.branch_id)
        .bind(ctx.company_id)
        .bind(ctx.actor_id)
        .bind(ctx.description.as_deref())
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            client_id,
            points,
            reason = ?reason,
            balance_before,
            balance_after,
            "points applied"
        );

        Ok(LedgerEntry {
            balance_before,
            balance_after,
            entry,
        })
    }

    /// History for a client, newest first.
    pub async fn history(
        &self,
        client_id: i64,
        filter: &HistoryFilter,
        page: PageRequest,
    ) -> Result<Page<PointsHistoryEntry>, LedgerError> {
        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM points_history WHERE client_id = ",
        );
        count.push_bind(client_id);
        push_filters(&mut count, filter);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT * FROM points_history WHERE client_id = ");
        query.push_bind(client_id);
        push_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, entry_id DESC LIMIT ")
            .push_bind(i64::from(page.limit()))
            .push(" OFFSET ")
            .push_bind(i64::from(page.offset()));

        let items = query
            .build_query_as::<PointsHistoryEntry>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            items,
            total,
            page: page.page.max(1),
            limit: page.limit(),
        })
    }

    /// Number of history entries with this reason written by one config
    /// scope. `branch_id` is `None` for company-wide (global) scope.
    pub async fn count_entries(
        &self,
        client_id: i64,
        reason: Reason,
        source: ConfigSource,
        company_id: i64,
        branch_id: Option<i64>,
    ) -> Result<i64, LedgerError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM points_history
             WHERE client_id = ? AND reason = ? AND config_source = ? AND company_id = ?
             AND (? IS NULL OR branch_id = ?)",
        )
        .bind(client_id)
        .bind(reason)
        .bind(source)
        .bind(company_id)
        .bind(branch_id)
        .bind(branch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, filter: &HistoryFilter) {
    if let Some(entry_type) = filter.entry_type {
        query.push(" AND entry_type = ").push_bind(entry_type);
    }
    if let Some(reason) = filter.reason {
        query.push(" AND reason = ").push_bind(reason);
    }
    if let Some(source) = filter.config_source {
        query.push(" AND config_source = ").push_bind(source);
    }
    if let Some(branch_id) = filter.branch_id {
        query.push(" AND branch_id = ").push_bind(branch_id);
    }
    if let Some(from) = filter.from {
        query.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        query.push(" AND created_at <= ").push_bind(to);
    }
}
