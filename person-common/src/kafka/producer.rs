use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::counter;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::kafka::config::KafkaConfig;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        metrics::gauge!("person_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        metrics::gauge!("person_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
    #[error("publisher is closed")]
    Closed,
    #[error("pending messages were not delivered before the shutdown timeout")]
    DrainTimeout,
}

/// A delivery that failed after `send_json` had already accepted it.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub topic: String,
    pub error: PublishError,
}

/// Asynchronous publishing: a successful `send_json` means the message was
/// accepted for delivery, not that a broker acknowledged it.
pub trait MessageSink {
    fn send_json(&self, topic: &str, payload: &Value) -> Result<(), PublishError>;
}

/// Receiving end of the failures reported by acknowledgement tasks.
pub type DeliveryFailures = mpsc::UnboundedReceiver<DeliveryFailure>;

/// Kafka producer shared by every partition worker.
///
/// librdkafka batches and compresses records in the background, flushing every
/// `kafka_producer_linger_ms`. Each accepted message gets an acknowledgement task
/// tracked here, so `close` can wait for all of them before the producer is dropped.
#[derive(Clone)]
pub struct MessagePublisher {
    producer: FutureProducer<KafkaContext>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    pending: TaskTracker,
    closed: Arc<AtomicBool>,
}

impl MessagePublisher {
    pub fn new(
        config: &KafkaConfig,
        liveness: HealthHandle,
    ) -> Result<(MessagePublisher, DeliveryFailures), KafkaError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = config.client_config();
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(10))
        {
            Ok(metadata) => {
                info!(
                    "connected to Kafka brokers, found {} topics",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = MessagePublisher {
            producer,
            failures: tx,
            pending: TaskTracker::new(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        Ok((publisher, rx))
    }

    async fn process_ack(
        delivery: DeliveryFuture,
        topic: String,
        failures: mpsc::UnboundedSender<DeliveryFailure>,
    ) {
        let error = match delivery.await {
            Ok(Ok(_)) => {
                counter!("person_kafka_messages_delivered_total", "topic" => topic).increment(1);
                return;
            }
            Ok(Err((err, _))) => PublishError::Kafka(err),
            // Cancelled due to timeout while retrying
            Err(_) => PublishError::Canceled,
        };

        if let Err(unreported) = failures.send(DeliveryFailure { topic, error }) {
            error!(
                "delivery failure could not be reported: {}",
                unreported.0.error
            );
        }
    }

    /// Stop accepting messages, then wait until every accepted message was either
    /// delivered or failed. Fails with `DrainTimeout` when that takes longer than `timeout`.
    pub async fn close(&self, timeout: Duration) -> Result<(), PublishError> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.closed.store(true, Ordering::SeqCst);
        self.pending.close();

        let producer = self.producer.clone();
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|_| PublishError::Canceled)?;
        match flushed {
            Ok(()) => {}
            Err(KafkaError::Flush(RDKafkaErrorCode::OperationTimedOut)) => {
                return Err(PublishError::DrainTimeout)
            }
            Err(e) => return Err(PublishError::Kafka(e)),
        }

        tokio::time::timeout_at(deadline, self.pending.wait())
            .await
            .map_err(|_| PublishError::DrainTimeout)?;

        info!("message publisher drained");
        Ok(())
    }
}

impl MessageSink for MessagePublisher {
    fn send_json(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        let payload = serde_json::to_string(payload)?;

        let delivery = self
            .producer
            .send_result(FutureRecord::<(), str>::to(topic).payload(payload.as_str()))
            .map_err(|(e, _)| {
                counter!("person_kafka_produce_errors_total").increment(1);
                PublishError::Kafka(e)
            })?;

        self.pending.spawn(Self::process_ack(
            delivery,
            topic.to_owned(),
            self.failures.clone(),
        ));
        Ok(())
    }
}

/// Log and count failed deliveries until every publisher clone is dropped.
pub async fn report_delivery_failures(mut failures: DeliveryFailures) {
    while let Some(failure) = failures.recv().await {
        counter!("person_kafka_delivery_failures_total", "topic" => failure.topic.clone())
            .increment(1);
        error!(topic = %failure.topic, "failed to deliver message: {}", failure.error);
    }
}
