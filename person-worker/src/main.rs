//! Consume inbound person messages, enrich them and store the result.
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use health::HealthRegistry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use person_common::kafka::producer::report_delivery_failures;
use person_common::kafka::{MessageConsumer, MessagePublisher};
use person_common::metrics::{serve, setup_metrics_routes};
use person_common::signal::shutdown_signal;
use person_common::store::PgPersonStore;
use person_worker::config::Config;
use person_worker::enrichment::EnrichmentClient;
use person_worker::error::WorkerError;
use person_worker::pipeline::IngestionPipeline;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let liveness = HealthRegistry::new("liveness");

    let store = PgPersonStore::new(&config.database_url, config.max_pg_connections).await?;

    let (publisher, delivery_failures) = MessagePublisher::new(
        &config.kafka,
        liveness.register("rdkafka-producer", time::Duration::seconds(30)),
    )?;
    tokio::spawn(report_delivery_failures(delivery_failures));

    let http_client = reqwest::Client::builder()
        .timeout(config.request_timeout.0)
        .build()?;
    let enrichment = EnrichmentClient::new(
        http_client,
        &config.age_api_url,
        &config.gender_api_url,
        &config.nationality_api_url,
    )?;

    let pipeline = IngestionPipeline::new(
        enrichment,
        Arc::new(store),
        Arc::new(publisher.clone()),
        &config.dead_letter_topic,
    );

    let consumer = MessageConsumer::new(&config.kafka, &config.consumer, liveness.clone())?;
    consumer.start(&config.inbound_topic, Arc::new(pipeline))?;

    let server_shutdown = CancellationToken::new();
    let router = setup_metrics_routes(Router::new(), liveness)
        .expect("failed to install metrics recorder");
    let bind = config.bind();
    let server = {
        let shutdown = server_shutdown.clone().cancelled_owned();
        tokio::spawn(async move {
            if let Err(e) = serve(router, &bind, shutdown).await {
                error!("failed to serve metrics on {}: {}", bind, e);
            }
        })
    };

    shutdown_signal().await;

    // One budget for the whole shutdown: whatever the consumer leaves is the publisher's.
    let deadline = Instant::now() + config.shutdown_timeout.0;
    let stopped = consumer.stop(deadline).await;
    let drained = publisher
        .close(deadline.saturating_duration_since(Instant::now()))
        .await;
    server_shutdown.cancel();
    if let Err(e) = server.await {
        error!("metrics server task failed: {}", e);
    }

    stopped?;
    drained?;
    info!("person-worker stopped");
    Ok(())
}
