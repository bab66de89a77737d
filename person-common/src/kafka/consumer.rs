use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use health::{HealthHandle, HealthRegistry};
use metrics::counter;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, Offset, TopicPartitionList};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::kafka::config::{ConsumerConfig, KafkaConfig};

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_DEADLINE: time::Duration = time::Duration::seconds(30);

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to create kafka consumer: {0}")]
    Create(KafkaError),
    #[error("failed to fetch metadata for topic {topic}: {error}")]
    Metadata { topic: String, error: KafkaError },
    #[error("topic {0} has no partitions")]
    NoPartitions(String),
    #[error("failed to assign partitions: {0}")]
    Assign(KafkaError),
    #[error("failed to open a stream for partition {partition} of topic {topic}")]
    PartitionStream { topic: String, partition: i32 },
    #[error("consumer was already started")]
    AlreadyStarted,
    #[error("consumer is closed")]
    Closed,
    #[error("partition workers did not stop before the deadline")]
    StopTimeout,
}

/// Processes one message at a time. Outcomes are the handler's business: whatever
/// happens in here, the partition worker moves on to the next message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]);
}

pub struct KafkaConsumerContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaConsumerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for KafkaConsumerContext {}

type PartitionQueue = StreamPartitionQueue<KafkaConsumerContext>;

enum ConsumerState {
    Created,
    Subscribed { topic: String, partitions: Vec<i32> },
    Closed,
}

/// Consumes every partition of one topic, with one task per partition.
///
/// Partitions are assigned directly rather than through group rebalancing, each
/// starting at the newest offset: messages produced before `start` are never seen.
/// No offset is committed, so a restarted process starts from the newest offset again.
/// The number of tasks is the partition count of the topic, fixed at `start`.
pub struct MessageConsumer {
    consumer: Arc<StreamConsumer<KafkaConsumerContext>>,
    liveness: HealthRegistry,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    state: Mutex<ConsumerState>,
}

impl MessageConsumer {
    pub fn new(
        kafka_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        liveness: HealthRegistry,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = kafka_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false");

        debug!("rdkafka configuration: {:?}", client_config);
        let context = KafkaConsumerContext {
            liveness: liveness.register("rdkafka-consumer", HEALTH_DEADLINE),
        };
        let consumer: StreamConsumer<KafkaConsumerContext> = client_config
            .create_with_context(context)
            .map_err(ConsumerError::Create)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            liveness,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: Mutex::new(ConsumerState::Created),
        })
    }

    fn state(&self) -> MutexGuard<'_, ConsumerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Discover the partitions of `topic` and start one worker per partition.
    /// Any failure to set up a partition aborts the whole start, before a single
    /// message is consumed. Returns the partitions being consumed.
    pub fn start(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Vec<i32>, ConsumerError> {
        let mut state = self.state();
        match *state {
            ConsumerState::Created => {}
            ConsumerState::Subscribed { .. } => return Err(ConsumerError::AlreadyStarted),
            ConsumerState::Closed => return Err(ConsumerError::Closed),
        }

        let partitions = self.partitions(topic)?;

        // Every queue must be split off before anything is assigned, so that no
        // message can land on the main consumer queue.
        let mut queues: Vec<(i32, PartitionQueue)> = Vec::with_capacity(partitions.len());
        for partition in &partitions {
            let queue = self
                .consumer
                .split_partition_queue(topic, *partition)
                .ok_or_else(|| ConsumerError::PartitionStream {
                    topic: topic.to_owned(),
                    partition: *partition,
                })?;
            queues.push((*partition, queue));
        }

        let mut assignment = TopicPartitionList::with_capacity(partitions.len());
        for partition in &partitions {
            assignment
                .add_partition_offset(topic, *partition, Offset::End)
                .map_err(ConsumerError::Assign)?;
        }
        self.consumer
            .assign(&assignment)
            .map_err(ConsumerError::Assign)?;

        self.tasks
            .spawn(drive_consumer(self.consumer.clone(), self.shutdown.clone()));
        for (partition, queue) in queues {
            let liveness = self
                .liveness
                .register(partition_component(topic, partition), HEALTH_DEADLINE);
            self.tasks.spawn(consume_partition(
                topic.to_owned(),
                partition,
                queue,
                handler.clone(),
                liveness,
                self.shutdown.clone(),
            ));
        }

        info!(topic, ?partitions, "consuming partitions");
        *state = ConsumerState::Subscribed {
            topic: topic.to_owned(),
            partitions: partitions.clone(),
        };
        Ok(partitions)
    }

    fn partitions(&self, topic: &str) -> Result<Vec<i32>, ConsumerError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), METADATA_TIMEOUT)
            .map_err(|error| ConsumerError::Metadata {
                topic: topic.to_owned(),
                error,
            })?;

        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();

        match partitions.is_empty() {
            true => Err(ConsumerError::NoPartitions(topic.to_owned())),
            false => Ok(partitions),
        }
    }

    /// Stop pulling messages on every partition and wait for the workers to exit.
    /// A message that is being handled when this is called is handled to completion,
    /// unless `deadline` passes first: the consumer is closed either way, but a worker
    /// still stuck in its handler is reported as `StopTimeout`.
    pub async fn stop(&self, deadline: Instant) -> Result<(), ConsumerError> {
        let previous = std::mem::replace(&mut *self.state(), ConsumerState::Closed);

        self.shutdown.cancel();
        self.tasks.close();
        let stopped = tokio::time::timeout_at(deadline, self.tasks.wait())
            .await
            .map_err(|_| ConsumerError::StopTimeout);

        if let ConsumerState::Subscribed { topic, partitions } = previous {
            if let Err(e) = self.consumer.unassign() {
                warn!("failed to unassign partitions: {}", e);
            }
            for partition in partitions {
                self.liveness
                    .deregister(&partition_component(&topic, partition));
            }
            info!(topic = %topic, "stopped consuming");
        }
        stopped
    }
}

fn partition_component(topic: &str, partition: i32) -> String {
    format!("partition-{}-{}", topic, partition)
}

/// The main queue still has to be polled for rdkafka to serve its events,
/// statistics included.
async fn drive_consumer(
    consumer: Arc<StreamConsumer<KafkaConsumerContext>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = consumer.recv() => match received {
                Ok(message) => warn!(
                    partition = message.partition(),
                    "message received outside of a partition queue"
                ),
                Err(e) => {
                    counter!("person_kafka_consumer_errors_total").increment(1);
                    error!("kafka consumer error: {}", e);
                }
            },
        }
    }
}

async fn consume_partition(
    topic: String,
    partition: i32,
    queue: PartitionQueue,
    handler: Arc<dyn MessageHandler>,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let partition_label = partition.to_string();

    loop {
        let payload = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = heartbeat.tick() => {
                liveness.report_healthy();
                continue;
            }
            received = queue.recv() => match received {
                Ok(message) => message.payload().map(<[u8]>::to_vec),
                Err(e) => {
                    counter!("person_kafka_consumer_errors_total").increment(1);
                    error!(topic = %topic, partition, "failed to receive message: {}", e);
                    continue;
                }
            },
        };
        liveness.report_healthy();

        counter!(
            "person_kafka_messages_received_total",
            "partition" => partition_label.clone()
        )
        .increment(1);
        match payload {
            Some(payload) => handler.handle(&payload).await,
            None => warn!(topic = %topic, partition, "skipping message without payload"),
        }
    }

    debug!(topic = %topic, partition, "partition worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::{DefaultProducerContext, FutureProducer, FutureRecord};
    use rdkafka::ClientConfig;

    /// Records payloads in arrival order. Payloads starting with "bad" are
    /// treated as failed messages: counted, never recorded.
    #[derive(Default)]
    struct RecordingHandler {
        seen: std::sync::Mutex<Vec<String>>,
        failed: AtomicUsize,
    }

    impl RecordingHandler {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, payload: &[u8]) {
            let payload = String::from_utf8_lossy(payload).into_owned();
            if payload.starts_with("bad") {
                self.failed.fetch_add(1, Ordering::SeqCst);
                return;
            }
            self.seen.lock().unwrap().push(payload);
        }
    }

    /// Never returns from its first message.
    #[derive(Default)]
    struct StuckHandler {
        entered: AtomicBool,
    }

    #[async_trait]
    impl MessageHandler for StuckHandler {
        async fn handle(&self, _: &[u8]) {
            self.entered.store(true, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    fn configs(
        cluster: &MockCluster<'static, DefaultProducerContext>,
    ) -> (KafkaConfig, ConsumerConfig) {
        let kafka = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_hosts: cluster.bootstrap_servers(),
            kafka_tls: false,
        };
        let consumer = ConsumerConfig {
            kafka_consumer_group: "person-worker-test".to_string(),
        };
        (kafka, consumer)
    }

    fn producer(cluster: &MockCluster<'static, DefaultProducerContext>) -> FutureProducer {
        ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .create()
            .expect("failed to create producer")
    }

    async fn produce(producer: &FutureProducer, partition: i32, payload: &str) {
        producer
            .send(
                FutureRecord::<(), str>::to("FIO")
                    .partition(partition)
                    .payload(payload),
                Duration::from_secs(5),
            )
            .await
            .expect("failed to produce");
    }

    /// Offsets are resolved asynchronously after assignment: keep producing
    /// markers on partition 0 until one of them comes through.
    /// Once the latest marker is seen, every earlier one was either skipped or seen.
    async fn wait_for_partition_zero(producer: &FutureProducer, handler: &RecordingHandler) {
        for i in 0..50 {
            let marker = format!("marker {}", i);
            produce(producer, 0, &marker).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if handler.seen().contains(&marker) {
                return;
            }
        }
        panic!("consumer never received a message");
    }

    async fn wait_for(handler: &RecordingHandler, count: usize) {
        for _ in 0..50 {
            if handler.seen().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn in_five_seconds() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_consumes_every_partition() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("FIO", 3, 1)
            .expect("failed to create topic");
        let (kafka_config, consumer_config) = configs(&cluster);

        let registry = HealthRegistry::new("liveness");
        let consumer = MessageConsumer::new(&kafka_config, &consumer_config, registry.clone())
            .expect("failed to create consumer");
        let handler = Arc::new(RecordingHandler::default());

        let mut partitions = consumer
            .start("FIO", handler.clone())
            .expect("failed to start consumer");
        partitions.sort();
        assert_eq!(partitions, vec![0, 1, 2]);

        let producer = producer(&cluster);

        // Offsets are resolved asynchronously after assignment, keep producing
        // until every partition delivered something.
        let expected: HashSet<String> = (0..3).map(|p| format!("partition {}", p)).collect();
        let seen = || handler.seen().into_iter().collect::<HashSet<String>>();
        for _ in 0..50 {
            for partition in 0..3 {
                produce(&producer, partition, &format!("partition {}", partition)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            if seen() == expected {
                break;
            }
        }
        assert_eq!(seen(), expected);

        consumer
            .stop(in_five_seconds())
            .await
            .expect("failed to stop consumer");
        assert!(matches!(
            consumer.start("FIO", handler.clone()),
            Err(ConsumerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_partition_order_is_kept_across_failed_messages() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("FIO", 1, 1)
            .expect("failed to create topic");
        let (kafka_config, consumer_config) = configs(&cluster);
        let consumer =
            MessageConsumer::new(&kafka_config, &consumer_config, HealthRegistry::new("liveness"))
                .expect("failed to create consumer");
        let handler = Arc::new(RecordingHandler::default());
        consumer
            .start("FIO", handler.clone())
            .expect("failed to start consumer");

        let producer = producer(&cluster);
        wait_for_partition_zero(&producer, &handler).await;
        let markers = handler.seen().len();

        for i in 0..20 {
            if i % 5 == 0 {
                produce(&producer, 0, &format!("bad {}", i)).await;
            }
            produce(&producer, 0, &format!("message {}", i)).await;
        }
        wait_for(&handler, markers + 20).await;

        let expected: Vec<String> = (0..20).map(|i| format!("message {}", i)).collect();
        assert_eq!(handler.seen()[markers..], expected[..]);
        assert_eq!(handler.failed.load(Ordering::SeqCst), 4);

        consumer
            .stop(in_five_seconds())
            .await
            .expect("failed to stop consumer");
    }

    #[tokio::test]
    async fn test_messages_produced_before_start_are_not_replayed() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("FIO", 1, 1)
            .expect("failed to create topic");
        let producer = producer(&cluster);
        for i in 0..5 {
            produce(&producer, 0, &format!("before {}", i)).await;
        }

        let (kafka_config, consumer_config) = configs(&cluster);
        let consumer =
            MessageConsumer::new(&kafka_config, &consumer_config, HealthRegistry::new("liveness"))
                .expect("failed to create consumer");
        let handler = Arc::new(RecordingHandler::default());
        consumer
            .start("FIO", handler.clone())
            .expect("failed to start consumer");

        wait_for_partition_zero(&producer, &handler).await;
        produce(&producer, 0, "after").await;
        wait_for(&handler, handler.seen().len() + 1).await;

        let seen = handler.seen();
        assert!(seen.contains(&"after".to_owned()));
        assert!(seen.iter().all(|p| !p.starts_with("before")));

        consumer
            .stop(in_five_seconds())
            .await
            .expect("failed to stop consumer");
    }

    #[tokio::test]
    async fn test_stop_gives_up_on_a_stuck_handler_at_the_deadline() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("FIO", 1, 1)
            .expect("failed to create topic");
        let (kafka_config, consumer_config) = configs(&cluster);
        let consumer =
            MessageConsumer::new(&kafka_config, &consumer_config, HealthRegistry::new("liveness"))
                .expect("failed to create consumer");
        let handler = Arc::new(StuckHandler::default());
        consumer
            .start("FIO", handler.clone())
            .expect("failed to start consumer");

        let producer = producer(&cluster);
        for _ in 0..50 {
            produce(&producer, 0, "stuck").await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if handler.entered.load(Ordering::SeqCst) {
                break;
            }
        }
        assert!(handler.entered.load(Ordering::SeqCst));

        let started = Instant::now();
        let stopped = consumer
            .stop(Instant::now() + Duration::from_millis(300))
            .await;

        assert!(matches!(stopped, Err(ConsumerError::StopTimeout)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cannot_start_twice() {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        cluster
            .create_topic("FIO", 2, 1)
            .expect("failed to create topic");
        let (kafka_config, consumer_config) = configs(&cluster);
        let consumer =
            MessageConsumer::new(&kafka_config, &consumer_config, HealthRegistry::new("liveness"))
                .expect("failed to create consumer");
        let handler = Arc::new(RecordingHandler::default());

        consumer
            .start("FIO", handler.clone())
            .expect("failed to start consumer");
        assert!(matches!(
            consumer.start("FIO", handler),
            Err(ConsumerError::AlreadyStarted)
        ));

        consumer
            .stop(in_five_seconds())
            .await
            .expect("failed to stop consumer");
    }
}
