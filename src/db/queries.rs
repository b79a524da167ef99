use anyhow::Result;
use sqlx::{Pool, Sqlite, query::QueryAs, sqlite::SqliteArguments};

use crate::db::{
    models::{CardLink, CardLinkStatus, Client, CreateClientRequest, CreateOrderRequest, LoyaltyConfig, Order},
    now_millis,
};

pub async fn get_client(pool: &Pool<Sqlite>, client_id: i64) -> Result<Option<Client>> {
    let client = sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE client_id = ?")
        .bind(client_id)
        .fetch_optional(pool)
        .await?;

    Ok(client)
}

pub async fn insert_client(pool: &Pool<Sqlite>, req: &CreateClientRequest) -> Result<Client> {
    let now = now_millis();
    let client = sqlx::query_as::<_, Client>(
        "INSERT INTO clients (company_id, branch_id, client_number, name, points_balance,
         created_at, updated_at)
         VALUES (?, ?, ?, ?, 0, ?, ?)
         RETURNING *",
    )
    .bind(req.company_id)
    .bind(req.branch_id)
    .bind(&req.client_number)
    .bind(&req.name)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    Ok(client)
}

pub async fn get_order(pool: &Pool<Sqlite>, order_id: i64) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE order_id = ?")
        .bind(order_id)
        .fetch_optional(pool)
        .await?;

    Ok(order)
}

pub async fn insert_order(pool: &Pool<Sqlite>, req: &CreateOrderRequest) -> Result<Order> {
    let order = sqlx::query_as::<_, Order>(
        "INSERT INTO orders (client_id, company_id, branch_id, total_cents, advance_cents,
         sent_to_production, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         RETURNING *",
    )
    .bind(req.client_id)
    .bind(req.company_id)
    .bind(req.branch_id)
    .bind(req.total_cents)
    .bind(req.advance_cents)
    .bind(req.sent_to_production)
    .bind(now_millis())
    .fetch_one(pool)
    .await?;

    Ok(order)
}

/// Records a payment signal that arrived after the order was created.
/// Fields left as `None` keep their stored value.
pub async fn update_order_payment(
    pool: &Pool<Sqlite>,
    order_id: i64,
    advance_cents: Option<i64>,
    sent_to_production: Option<bool>,
) -> Result<Option<Order>> {
    let order = sqlx::query_as::<_, Order>(
        "UPDATE orders SET advance_cents = COALESCE(?, advance_cents),
         sent_to_production = COALESCE(?, sent_to_production)
         WHERE order_id = ?
         RETURNING *",
    )
    .bind(advance_cents)
    .bind(sent_to_production)
    .bind(order_id)
    .fetch_optional(pool)
    .await?;

    Ok(order)
}

/// Orders with a payment signal (an advance or sent to production).
///
/// `branch_id` narrows the count to one branch; `None` counts every branch
/// of the company.
pub async fn count_qualifying_orders(
    pool: &Pool<Sqlite>,
    client_id: i64,
    company_id: i64,
    branch_id: Option<i64>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM orders
         WHERE client_id = ? AND company_id = ?
         AND (? IS NULL OR branch_id = ?)
         AND (advance_cents > 0 OR sent_to_production = 1)",
    )
    .bind(client_id)
    .bind(company_id)
    .bind(branch_id)
    .bind(branch_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Enabled configs that apply to a branch: the company-level one and the
/// branch's own, global first.
pub async fn get_active_configs(
    pool: &Pool<Sqlite>,
    company_id: i64,
    branch_id: Option<i64>,
) -> Result<Vec<LoyaltyConfig>> {
    let configs = sqlx::query_as::<_, LoyaltyConfig>(
        "SELECT * FROM loyalty_configs
         WHERE company_id = ? AND enabled = 1
         AND (branch_id IS NULL OR branch_id = ?)
         ORDER BY branch_id IS NOT NULL, config_id",
    )
    .bind(company_id)
    .bind(branch_id)
    .fetch_all(pool)
    .await?;

    Ok(configs)
}

/// Saves the config for a (company, branch) scope, replacing the previous one.
pub async fn upsert_config(pool: &Pool<Sqlite>, config: &LoyaltyConfig) -> Result<LoyaltyConfig> {
    let mut tx = pool.begin().await?;

    // Update first so the transaction starts with a write.
    let updated = bind_config_fields(
        sqlx::query_as::<_, LoyaltyConfig>(
            "UPDATE loyalty_configs SET enabled = ?, purchase_amount_enabled = ?,
             purchase_threshold_cents = ?, points_per_threshold = ?, accumulated_enabled = ?,
             purchases_required = ?, points_per_milestone = ?, first_purchase_enabled = ?,
             first_purchase_points = ?, registration_enabled = ?, registration_points = ?,
             visit_points = ?
             WHERE company_id = ? AND IFNULL(branch_id, 0) = IFNULL(?, 0)
             RETURNING *",
        ),
        config,
    )
    .bind(config.company_id)
    .bind(config.branch_id)
    .fetch_optional(&mut *tx)
    .await?;

    let saved = match updated {
        Some(saved) => saved,
        None => {
            bind_config_fields(
                sqlx::query_as::<_, LoyaltyConfig>(
                    "INSERT INTO loyalty_configs (enabled, purchase_amount_enabled,
                     purchase_threshold_cents, points_per_threshold, accumulated_enabled,
                     purchases_required, points_per_milestone, first_purchase_enabled,
                     first_purchase_points, registration_enabled, registration_points,
                     visit_points, company_id, branch_id)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                     RETURNING *",
                ),
                config,
            )
            .bind(config.company_id)
            .bind(config.branch_id)
            .fetch_one(&mut *tx)
            .await?
        }
    };
    tx.commit().await?;

    Ok(saved)
}

fn bind_config_fields<'q>(
    query: QueryAs<'q, Sqlite, LoyaltyConfig, SqliteArguments<'q>>,
    config: &LoyaltyConfig,
) -> QueryAs<'q, Sqlite, LoyaltyConfig, SqliteArguments<'q>> {
    query
        .bind(config.enabled)
        .bind(config.purchase_amount_enabled)
        .bind(config.purchase_threshold_cents)
        .bind(config.points_per_threshold)
        .bind(config.accumulated_enabled)
        .bind(config.purchases_required)
        .bind(config.points_per_milestone)
        .bind(config.first_purchase_enabled)
        .bind(config.first_purchase_points)
        .bind(config.registration_enabled)
        .bind(config.registration_points)
        .bind(config.visit_points)
}

pub async fn get_card_link(pool: &Pool<Sqlite>, link_id: i64) -> Result<Option<CardLink>> {
    let link = sqlx::query_as::<_, CardLink>("SELECT * FROM card_links WHERE link_id = ?")
        .bind(link_id)
        .fetch_optional(pool)
        .await?;

    Ok(link)
}

pub async fn get_card_link_by_remote_id(
    pool: &Pool<Sqlite>,
    remote_card_id: &str,
) -> Result<Option<CardLink>> {
    let link = sqlx::query_as::<_, CardLink>(
        "SELECT * FROM card_links WHERE remote_card_id = ? ORDER BY status = 'active' DESC, link_id DESC",
    )
    .bind(remote_card_id)
    .fetch_optional(pool)
    .await?;

    Ok(link)
}

pub async fn get_active_card_link(
    pool: &Pool<Sqlite>,
    client_id: i64,
    branch_id: Option<i64>,
) -> Result<Option<CardLink>> {
    let link = sqlx::query_as::<_, CardLink>(
        "SELECT * FROM card_links
         WHERE client_id = ? AND IFNULL(branch_id, 0) = IFNULL(?, 0) AND status = 'active'",
    )
    .bind(client_id)
    .bind(branch_id)
    .fetch_optional(pool)
    .await?;

    Ok(link)
}

pub async fn get_active_card_links(pool: &Pool<Sqlite>, client_id: i64) -> Result<Vec<CardLink>> {
    let links = sqlx::query_as::<_, CardLink>(
        "SELECT * FROM card_links WHERE client_id = ? AND status = 'active' ORDER BY link_id",
    )
    .bind(client_id)
    .fetch_all(pool)
    .await?;

    Ok(links)
}

/// Records the provider card for a client, replacing any active link for the
/// same (client, branch) pair. Re-registering the same remote card updates it
/// in place.
pub async fn activate_card_link(
    pool: &Pool<Sqlite>,
    client_id: i64,
    branch_id: Option<i64>,
    remote_card_id: &str,
    remote_pass_id: Option<&str>,
    qr_code: Option<&str>,
    synced_points: i64,
) -> Result<CardLink> {
    let now = now_millis();
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE card_links SET status = 'inactive', updated_at = ?
         WHERE client_id = ? AND IFNULL(branch_id, 0) = IFNULL(?, 0)
         AND status = 'active' AND remote_card_id != ?",
    )
    .bind(now)
    .bind(client_id)
    .bind(branch_id)
    .bind(remote_card_id)
    .execute(&mut *tx)
    .await?;

    let existing = sqlx::query_as::<_, CardLink>(
        "UPDATE card_links SET status = 'active', remote_pass_id = COALESCE(?, remote_pass_id),
         qr_code = COALESCE(?, qr_code), last_synced_points = ?, last_sync_at = ?, updated_at = ?
         WHERE client_id = ? AND remote_card_id = ?
         RETURNING *",
    )
    .bind(remote_pass_id)
    .bind(qr_code)
    .bind(synced_points)
    .bind(now)
    .bind(now)
    .bind(client_id)
    .bind(remote_card_id)
    .fetch_optional(&mut *tx)
    .await?;

    let link = match existing {
        Some(link) => link,
        None => {
            sqlx::query_as::<_, CardLink>(
                "INSERT INTO card_links (client_id, remote_card_id, remote_pass_id, branch_id,
                 status, last_synced_points, last_sync_at, qr_code, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'active', ?, ?, ?, ?, ?)
                 RETURNING *",
            )
            .bind(client_id)
            .bind(remote_card_id)
            .bind(remote_pass_id)
            .bind(branch_id)
            .bind(synced_points)
            .bind(now)
            .bind(qr_code)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?
        }
    };

    tx.commit().await?;
    Ok(link)
}

/// Advances the sync watermark after the provider acknowledged `points`.
pub async fn mark_card_synced(pool: &Pool<Sqlite>, link_id: i64, points: i64) -> Result<()> {
    let now = now_millis();
    sqlx::query(
        "UPDATE card_links SET last_synced_points = ?, last_sync_at = ?, updated_at = ?
         WHERE link_id = ?",
    )
    .bind(points)
    .bind(now)
    .bind(now)
    .bind(link_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn set_card_link_status(
    pool: &Pool<Sqlite>,
    link_id: i64,
    status: CardLinkStatus,
) -> Result<()> {
    sqlx::query("UPDATE card_links SET status = ?, updated_at = ? WHERE link_id = ?")
        .bind(status)
        .bind(now_millis())
        .bind(link_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn set_card_link_tier(pool: &Pool<Sqlite>, link_id: i64, tier: &str) -> Result<()> {
    sqlx::query("UPDATE card_links SET remote_tier = ?, updated_at = ? WHERE link_id = ?")
        .bind(tier)
        .bind(now_millis())
        .bind(link_id)
        .execute(pool)
        .await?;

    Ok(())
}
