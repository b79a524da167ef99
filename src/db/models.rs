use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Client {
    pub client_id: i64,
    pub company_id: i64,
    pub branch_id: Option<i64>,
    pub client_number: String,
    pub name: String,
    pub points_balance: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EntryType {
    Earned,
    Redeemed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Reason {
    PurchaseAmount,
    AccumulatedPurchases,
    FirstPurchase,
    ClientRegistration,
    BranchVisit,
    Redemption,
    ManualAdjustment,
    Expiration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ConfigSource {
    Global,
    Branch,
    Manual,
}

/// Immutable audit record of one ledger mutation.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PointsHistoryEntry {
    pub entry_id: i64,
    pub client_id: i64,
    pub order_id: Option<i64>,
    /// Signed amount exactly as requested, even when the balance was clamped.
    pub points: i64,
    pub entry_type: EntryType,
    pub reason: Reason,
    pub config_source: ConfigSource,
    pub balance_before: i64,
    pub balance_after: i64,
    pub branch_id: Option<i64>,
    pub company_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub order_id: i64,
    pub client_id: i64,
    pub company_id: i64,
    pub branch_id: i64,
    pub total_cents: i64,
    pub advance_cents: i64,
    pub sent_to_production: bool,
    pub created_at: i64,
}

/// Points rules for a company (`branch_id` unset) or for one branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, sqlx::FromRow)]
#[serde(default)]
pub struct LoyaltyConfig {
    pub config_id: i64,
    pub company_id: i64,
    pub branch_id: Option<i64>,
    pub enabled: bool,
    pub purchase_amount_enabled: bool,
    pub purchase_threshold_cents: i64,
    pub points_per_threshold: i64,
    pub accumulated_enabled: bool,
    pub purchases_required: i64,
    pub points_per_milestone: i64,
    pub first_purchase_enabled: bool,
    pub first_purchase_points: i64,
    pub registration_enabled: bool,
    pub registration_points: i64,
    pub visit_points: i64,
}

impl LoyaltyConfig {
    pub fn source(&self) -> ConfigSource {
        if self.branch_id.is_some() {
            ConfigSource::Branch
        } else {
            ConfigSource::Global
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CardLinkStatus {
    Active,
    Inactive,
    Suspended,
    Expired,
}

/// Mapping between a local client and its card at the wallet provider.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CardLink {
    pub link_id: i64,
    pub client_id: i64,
    pub remote_card_id: String,
    pub remote_pass_id: Option<String>,
    pub branch_id: Option<i64>,
    pub status: CardLinkStatus,
    pub last_synced_points: i64,
    pub last_sync_at: Option<i64>,
    pub remote_tier: Option<String>,
    pub qr_code: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CardLink {
    pub fn needs_sync(&self, current_balance: i64) -> bool {
        self.last_synced_points != current_balance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncOperation {
    PointsUpdate,
    CardRegister,
    CardDeactivate,
    RewardRedeem,
    TierUpdate,
    ProfileUpdate,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::PointsUpdate => "points_update",
            SyncOperation::CardRegister => "card_register",
            SyncOperation::CardDeactivate => "card_deactivate",
            SyncOperation::RewardRedeem => "reward_redeem",
            SyncOperation::TierUpdate => "tier_update",
            SyncOperation::ProfileUpdate => "profile_update",
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// One failed attempt, kept in the job's error history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub code: Option<String>,
    pub occurred_at: i64,
    pub attempt: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncJob {
    pub job_id: i64,
    pub operation: SyncOperation,
    pub status: JobStatus,
    pub priority: i64,
    pub client_id: i64,
    pub card_link_id: Option<i64>,
    pub branch_id: Option<i64>,
    pub order_id: Option<i64>,
    pub payload: Json<serde_json::Value>,
    pub response: Option<Json<serde_json::Value>>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub next_retry_at: Option<i64>,
    pub last_error_message: Option<String>,
    pub last_error_code: Option<String>,
    pub last_error_at: Option<i64>,
    pub error_history: Json<Vec<JobError>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub lock_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientRequest {
    pub company_id: i64,
    pub branch_id: Option<i64>,
    pub client_number: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub client_id: i64,
    pub company_id: i64,
    pub branch_id: i64,
    pub total_cents: i64,
    pub advance_cents: i64,
    pub sent_to_production: bool,
}
