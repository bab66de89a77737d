use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::{HealthHandle, HealthRegistry};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use person_common::cache::{KeyValueCache, RedisCache};
use person_common::metrics::{serve, setup_metrics_routes};
use person_common::reader::CacheAsideReader;
use person_common::service::PersonService;
use person_common::signal::shutdown_signal;
use person_common::store::{PersonStore, PgPersonStore};

mod config;
mod handlers;

/// The API has no background worker to vouch for it, so the process reports itself.
async fn heartbeat(handle: HealthHandle) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        handle.report_healthy();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    tokio::spawn(heartbeat(
        liveness.register("http", time::Duration::seconds(30)),
    ));

    let store: Arc<dyn PersonStore + Send + Sync> = Arc::new(
        PgPersonStore::new(&config.database_url, config.max_pg_connections).await?,
    );

    let cache: Option<Arc<dyn KeyValueCache + Send + Sync>> = match &config.redis_url {
        Some(url) => {
            info!("caching person reads for {:?}", config.cache_ttl.0);
            Some(Arc::new(RedisCache::new(url, config.redis_timeout.0)?))
        }
        None => {
            warn!("REDIS_URL is not set, person reads will not be cached");
            None
        }
    };

    let reader = CacheAsideReader::new(store.clone(), cache, config.cache_ttl.0);
    let service = PersonService::new(store, reader);

    let app = handlers::add_routes(Router::new(), service);
    let app = setup_metrics_routes(app, liveness)?;

    let bind = config.bind();
    info!("person-api listening on {}", bind);
    serve(app, &bind, shutdown_signal()).await?;

    info!("person-api stopped");
    Ok(())
}
