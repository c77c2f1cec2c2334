//! Herald delivery worker binary entrypoint.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::create_pool;
use herald_common::redis_pool::create_redis_pool;

use herald_pipeline::cache::UserCacheService;
use herald_pipeline::delivery::DeliveryService;
use herald_pipeline::gateway::{HttpPushGateway, PushGateway};
use herald_pipeline::queue::NotificationQueue;
use herald_pipeline::store::PgNotificationStore;
use herald_pipeline::supervisor::WorkerSupervisor;
use herald_pipeline::metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_worker=info,herald_pipeline=debug".into()),
        )
        .json()
        .init();

    tracing::info!("Herald delivery worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Connect to database
    let pool = create_pool(&config.database_url, config.db_max_connections).await?;

    // Run migrations
    sqlx::migrate!("../../migrations").run(&pool).await?;
    tracing::info!("Database migrations applied");

    // Connect to Redis
    let redis = create_redis_pool(&config.redis_url).await?;

    // Install the Prometheus recorder
    metrics::init_metrics();

    let store = Arc::new(PgNotificationStore::new(pool));
    let cache = Arc::new(UserCacheService::new(redis.clone(), store.clone()));

    let gateway = Arc::new(HttpPushGateway::new(
        config.push_gateway_url.clone(),
        config.push_gateway_token.clone(),
    )?);
    if let Err(e) = gateway.health_check().await {
        tracing::warn!(error = %e, "Push gateway unreachable at startup");
    }

    let delivery = Arc::new(DeliveryService::new(
        cache.clone(),
        store.clone(),
        gateway,
    ));

    let queue = NotificationQueue::new(
        redis,
        config.queue_key.clone(),
        Duration::from_secs(config.dequeue_timeout_secs),
    );

    let supervisor = WorkerSupervisor::new(queue, store, delivery, config.listener_count);
    supervisor.start().await;

    // Run until shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    supervisor.stop().await;

    tracing::info!("Herald delivery worker stopped.");
    Ok(())
}
