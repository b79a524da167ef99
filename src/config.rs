use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "loyalty-sync")]
#[command(about = "Loyalty points ledger with wallet provider sync")]
#[command(version)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://loyalty.db?mode=rwc")]
    pub database_url: String,

    /// Secret the credential signing and encryption keys derive from
    #[arg(long, env = "CREDENTIAL_SECRET")]
    pub credential_secret: String,

    /// Use a random IV per credential instead of the secret-derived one
    #[arg(long, env = "CREDENTIAL_RANDOM_IV")]
    pub credential_random_iv: bool,

    /// Validity of minted card credentials, in days
    #[arg(long, env = "CARD_VALIDITY_DAYS", default_value = "30")]
    pub card_validity_days: i64,

    /// Base URL of the Luyoa loyalty API
    #[arg(long, env = "LUYOA_BASE_URL", default_value = "https://api.luyoa.com/v1")]
    pub luyoa_base_url: String,

    /// API key for the Luyoa loyalty API
    #[arg(long, env = "LUYOA_API_KEY", default_value = "")]
    pub luyoa_api_key: String,

    /// Request timeout for provider calls, in seconds
    #[arg(long, env = "LUYOA_TIMEOUT_SECS", default_value = "30")]
    pub luyoa_timeout_secs: u64,

    /// Use an in-process mock instead of the Luyoa API
    #[arg(long, env = "MOCK_PROVIDER")]
    pub mock_provider: bool,

    /// Identifier this process leases sync jobs under
    #[arg(long, env = "WORKER_ID", default_value = "sync-worker-1")]
    pub worker_id: String,

    /// Jobs leased per worker round
    #[arg(long, env = "WORKER_BATCH_SIZE", default_value = "10")]
    pub worker_batch_size: usize,

    /// Idle sleep between worker rounds, in milliseconds
    #[arg(long, env = "WORKER_POLL_INTERVAL_MS", default_value = "5000")]
    pub worker_poll_interval_ms: u64,
}

impl Config {
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.luyoa_timeout_secs)
    }
}
