//! Kafka consumer for the museum pipeline.
//!
//! Messages are handled strictly one at a time: a message is decoded,
//! validated, transformed and (optionally) written before the next one is
//! requested from the broker. Offsets are committed by the client's
//! auto-commit.

use crate::config::KafkaConfig;
use crate::event::RawEvent;
use crate::repository::{RecordStore, StoreError};
use crate::transform::{Record, Transformer};
use crate::validator::Rejection;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, trace, warn};

/// Errors that can occur while setting up consumption
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),
}

/// Metadata about a received message
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    /// Topic the message was received from
    pub topic: String,
    /// Partition the message was received from
    pub partition: i32,
    /// Offset of the message in the partition
    pub offset: i64,
    /// Broker timestamp in milliseconds since the epoch
    pub timestamp: Option<i64>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Raw message payload, if the message had one
    pub payload: Option<Vec<u8>>,
    /// Message metadata
    pub metadata: MessageMetadata,
}

/// Switches for which record shapes get written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub load_review: bool,
    pub load_incident: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            load_review: true,
            load_incident: true,
        }
    }
}

impl LoadOptions {
    pub fn allows(&self, record: &Record) -> bool {
        match record {
            Record::Review(_) => self.load_review,
            Record::Incident(_) => self.load_incident,
        }
    }
}

/// What happened to a single message
#[derive(Debug)]
pub enum MessageOutcome {
    /// Written to `table`
    Loaded { table: &'static str },
    /// Valid, but loading of this record shape is switched off
    Skipped { table: &'static str },
    /// Valid, and loading is switched off altogether
    Transformed { table: &'static str },
    /// Broke a business rule
    Rejected(Rejection),
    /// Payload was missing or not a JSON object
    Undecodable(String),
    /// The database refused the record or could not be reached
    Failed {
        table: &'static str,
        error: StoreError,
    },
}

/// Decodes, transforms and loads individual messages
pub struct EventProcessor {
    transformer: Transformer,
    store: Option<Arc<dyn RecordStore>>,
    options: LoadOptions,
}

impl EventProcessor {
    /// A processor that transforms but never loads
    pub fn new(transformer: Transformer) -> Self {
        Self {
            transformer,
            store: None,
            options: LoadOptions::default(),
        }
    }

    /// Load transformed records into `store`
    pub fn with_store(mut self, store: Arc<dyn RecordStore>, options: LoadOptions) -> Self {
        self.store = Some(store);
        self.options = options;
        self
    }

    pub fn loads(&self) -> bool {
        self.store.is_some()
    }

    /// Process one message against the current clock
    #[instrument(
        skip(self, message),
        fields(partition = message.metadata.partition, offset = message.metadata.offset)
    )]
    pub async fn process(&self, message: &IncomingMessage) -> MessageOutcome {
        self.process_payload(message.payload.as_deref(), Utc::now()).await
    }

    /// Process a raw payload against a fixed clock
    pub async fn process_payload(
        &self,
        payload: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> MessageOutcome {
        let raw = match RawEvent::decode(payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Message could not be decoded, no data saved");
                return MessageOutcome::Undecodable(e.to_string());
            }
        };

        info!(data = %raw, "Message contains data");

        let record = match self.transformer.try_transform_at(&raw, now) {
            Ok(record) => record,
            Err(rejection) => {
                warn!(reason = %rejection, "Message had incorrect data, no data saved");
                return MessageOutcome::Rejected(rejection);
            }
        };

        let table = record.table();
        info!(table, record = ?record, "Transformed message");

        let Some(store) = &self.store else {
            return MessageOutcome::Transformed { table };
        };

        if !self.options.allows(&record) {
            info!(table, "Loading {} data skipped", table);
            return MessageOutcome::Skipped { table };
        }

        info!(table, "Loading {} data into database", table);

        match store.insert(&record).await {
            Ok(()) => MessageOutcome::Loaded { table },
            Err(error) => {
                error!(table, error = %error, "Failed to load record");
                MessageOutcome::Failed { table, error }
            }
        }
    }
}

/// Kafka consumer for kiosk events
pub struct MuseumConsumer {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    shutdown_tx: watch::Sender<bool>,
}

impl MuseumConsumer {
    /// Create a new consumer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            "Creating Kafka consumer for {} with group {}",
            config.bootstrap_servers, config.group_id
        );

        let consumer: StreamConsumer = config
            .build_consumer_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            shutdown_tx,
        })
    }

    /// Subscribe to the configured topic
    pub fn subscribe(&self) -> Result<(), ConsumerError> {
        info!(topic = %self.config.topic, "Receiving messages from '{}' topic", self.config.topic);
        self.consumer
            .subscribe(&[self.config.topic.as_str()])
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Signal shutdown to stop consuming. A signal sent before `run` starts
    /// still stops it.
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        self.shutdown_tx.send_replace(true);
    }

    /// Consume messages until shutdown is signalled
    #[instrument(skip(self, processor), fields(topic = %self.config.topic))]
    pub async fn run(&self, processor: &EventProcessor) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let poll_timeout = self.config.poll_timeout();

        info!("Starting feed loop");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.wait_for(|stopped| *stopped) => {
                    info!("Received shutdown signal");
                    break;
                }
                polled = poll(&self.consumer, poll_timeout) => {
                    match polled {
                        None => {
                            trace!("No message within poll timeout");
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Kafka error");
                        }
                        Some(Ok(incoming)) => {
                            info!(
                                topic = %incoming.metadata.topic,
                                partition = incoming.metadata.partition,
                                offset = incoming.metadata.offset,
                                timestamp = ?incoming.metadata.timestamp,
                                "Received message"
                            );

                            let outcome = processor.process(&incoming).await;
                            debug!(outcome = ?outcome, "Message processed");
                        }
                    }
                }
            }
        }

        info!("Feed loop stopped");
    }
}

/// Wait up to `timeout` for one message
async fn poll(
    consumer: &StreamConsumer,
    timeout: Duration,
) -> Option<Result<IncomingMessage, rdkafka::error::KafkaError>> {
    match tokio::time::timeout(timeout, consumer.recv()).await {
        Err(_) => None,
        Ok(Err(e)) => Some(Err(e)),
        Ok(Ok(message)) => Some(Ok(convert_message(&message))),
    }
}

/// Convert a borrowed Kafka message to our IncomingMessage type
fn convert_message<M: KafkaMessage>(msg: &M) -> IncomingMessage {
    IncomingMessage {
        payload: msg.payload().map(|p| p.to_vec()),
        metadata: MessageMetadata {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            timestamp: msg.timestamp().to_millis(),
        },
    }
}
