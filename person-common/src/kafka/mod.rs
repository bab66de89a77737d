pub mod config;
pub mod consumer;
pub mod producer;

pub use config::{ConsumerConfig, KafkaConfig};
pub use consumer::{ConsumerError, MessageConsumer, MessageHandler};
pub use producer::{DeliveryFailure, MessagePublisher, MessageSink, PublishError};
