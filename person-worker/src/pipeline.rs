use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use person_common::kafka::{MessageHandler, MessageSink};
use person_common::person::{NewPerson, Person};
use person_common::store::PersonStore;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::enrichment::EnrichmentClient;
use crate::error::IngestError;

/// The inbound wire format. Attributes that enrichment infers are ignored even
/// when present, they are always recomputed.
#[derive(Deserialize)]
struct InboundPerson {
    #[serde(default)]
    name: String,
    #[serde(default)]
    surname: String,
    #[serde(default)]
    patronymic: Option<String>,
}

impl From<InboundPerson> for NewPerson {
    fn from(inbound: InboundPerson) -> Self {
        NewPerson {
            patronymic: inbound.patronymic.filter(|p| !p.is_empty()),
            ..NewPerson::new(&inbound.name, &inbound.surname)
        }
    }
}

/// Terminal state of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Persisted(u64),
    DecodeFailed,
    EnrichFailed,
    PersistFailed,
}

impl MessageOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Persisted(_) => "persisted",
            MessageOutcome::DecodeFailed => "decode_failed",
            MessageOutcome::EnrichFailed => "enrich_failed",
            MessageOutcome::PersistFailed => "persist_failed",
        }
    }
}

impl From<&IngestError> for MessageOutcome {
    fn from(e: &IngestError) -> Self {
        match e {
            IngestError::Decode(_) => MessageOutcome::DecodeFailed,
            IngestError::MissingRequiredFields | IngestError::Enrichment(_) => {
                MessageOutcome::EnrichFailed
            }
            IngestError::Persist(_) => MessageOutcome::PersistFailed,
        }
    }
}

/// Turns inbound messages into enriched, stored persons.
///
/// Every message is attempted exactly once: a failure at any step publishes the
/// original payload to the dead-letter topic and the message is done. Nothing
/// is retried here, reprocessing the dead-letter topic is up to its consumers.
pub struct IngestionPipeline {
    enrichment: EnrichmentClient,
    store: Arc<dyn PersonStore + Send + Sync>,
    sink: Arc<dyn MessageSink + Send + Sync>,
    dead_letter_topic: String,
}

impl IngestionPipeline {
    pub fn new(
        enrichment: EnrichmentClient,
        store: Arc<dyn PersonStore + Send + Sync>,
        sink: Arc<dyn MessageSink + Send + Sync>,
        dead_letter_topic: &str,
    ) -> Self {
        Self {
            enrichment,
            store,
            sink,
            dead_letter_topic: dead_letter_topic.to_owned(),
        }
    }

    #[instrument(skip_all)]
    pub async fn process(&self, payload: &[u8]) -> MessageOutcome {
        let outcome = match self.ingest(payload).await {
            Ok(person) => {
                info!(
                    id = person.id,
                    name = %person.name,
                    surname = %person.surname,
                    "person create completed"
                );
                MessageOutcome::Persisted(person.id)
            }
            Err(e) => {
                warn!("{}: {}", e.reason(), e);
                self.dead_letter(&e, payload);
                MessageOutcome::from(&e)
            }
        };

        counter!("person_ingested_messages_total", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn ingest(&self, payload: &[u8]) -> Result<Person, IngestError> {
        // Derived struct impls also accept a sequence, the wire format is an object only.
        let object: Map<String, Value> =
            serde_json::from_slice(payload).map_err(IngestError::Decode)?;
        let inbound: InboundPerson =
            serde_json::from_value(Value::Object(object)).map_err(IngestError::Decode)?;
        let mut person = NewPerson::from(inbound);

        if person.name.is_empty() || person.surname.is_empty() {
            return Err(IngestError::MissingRequiredFields);
        }

        self.enrichment
            .enrich(&person.name)
            .await?
            .apply_to(&mut person);

        self.store
            .create(person)
            .await
            .map_err(IngestError::Persist)
    }

    /// Best effort: a failed publish is logged and counted, never retried.
    fn dead_letter(&self, e: &IngestError, payload: &[u8]) {
        let annotated = dead_letter_body(e, payload);

        match self.sink.send_json(&self.dead_letter_topic, &annotated) {
            Ok(()) => {
                counter!("person_dead_letter_publishes_total", "reason" => e.reason())
                    .increment(1);
            }
            Err(publish_error) => {
                counter!("person_dead_letter_publish_failures_total").increment(1);
                error!(
                    topic = %self.dead_letter_topic,
                    "failed to publish to dead-letter topic: {}",
                    publish_error
                );
            }
        }
    }
}

/// `"<reason>: <detail>; message: <original payload>"`, as a JSON string.
fn dead_letter_body(e: &IngestError, payload: &[u8]) -> Value {
    Value::String(format!(
        "{}: {}; message: {}",
        e.reason(),
        e,
        String::from_utf8_lossy(payload)
    ))
}

#[async_trait]
impl MessageHandler for IngestionPipeline {
    async fn handle(&self, payload: &[u8]) {
        self.process(payload).await;
    }
}
