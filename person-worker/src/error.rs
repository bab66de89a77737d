use person_common::kafka::{ConsumerError, PublishError};
use person_common::store::StoreError;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::enrichment::EnrichmentError;

/// Why a single inbound message did not end up as a stored person.
/// None of these stop the partition worker: they end with a dead-letter publish.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{0}")]
    Decode(serde_json::Error),
    #[error("name and surname are required")]
    MissingRequiredFields,
    #[error("{0}")]
    Enrichment(#[from] EnrichmentError),
    #[error("{0}")]
    Persist(StoreError),
}

impl IngestError {
    /// Prefix of the dead-letter annotation, consumers of that topic match on it.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::Decode(_) => "invalid format",
            _ => "can't create a person",
        }
    }
}

/// Enumeration of errors that stop the worker process.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect to the database: {0}")]
    StoreError(#[from] StoreError),
    #[error("failed to create the kafka producer: {0}")]
    KafkaError(#[from] KafkaError),
    #[error("kafka consumer failed: {0}")]
    ConsumerError(#[from] ConsumerError),
    #[error("failed to build the enrichment http client: {0}")]
    HttpClientError(#[from] reqwest::Error),
    #[error("invalid enrichment service url: {0}")]
    UrlError(#[from] url::ParseError),
    #[error("failed to shut down cleanly: {0}")]
    ShutdownError(#[from] PublishError),
}
