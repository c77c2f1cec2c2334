use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Push gateway endpoint for batched device notifications
    pub push_gateway_url: String,

    /// Optional bearer token for the push gateway
    pub push_gateway_token: Option<String>,

    /// Redis list key backing the notification queue
    pub queue_key: String,

    /// Number of listener loops draining the queue (default: 2)
    pub listener_count: usize,

    /// Blocking-pop timeout in seconds for queue reads (default: 5)
    pub dequeue_timeout_secs: u64,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            push_gateway_url: std::env::var("PUSH_GATEWAY_URL")
                .unwrap_or_else(|_| "https://exp.host/--/api/v2/push/send".to_string()),
            push_gateway_token: std::env::var("PUSH_GATEWAY_TOKEN").ok(),
            queue_key: std::env::var("NOTIFICATION_QUEUE_KEY")
                .unwrap_or_else(|_| "herald:notifications".to_string()),
            listener_count: std::env::var("NOTIFICATION_LISTENER_COUNT")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("NOTIFICATION_LISTENER_COUNT must be a valid usize"))?,
            dequeue_timeout_secs: std::env::var("NOTIFICATION_DEQUEUE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| {
                    anyhow::anyhow!("NOTIFICATION_DEQUEUE_TIMEOUT_SECS must be a valid u64")
                })?,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
        })
    }
}
