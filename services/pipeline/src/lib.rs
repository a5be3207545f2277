//! Museum Pipeline - Kafka to Postgres loader for exhibition kiosks
//!
//! Every exhibition has a kiosk where visitors rate their visit or call for
//! help. Kiosk presses arrive on a Kafka topic as small JSON documents. This
//! library turns them into rows:
//!
//! - Ratings become rows in the `review` table
//! - Assistance and emergency requests become rows in the `incident` table
//! - Anything malformed, out of range, outside opening hours or from the
//!   future is logged and dropped
//!
//! ## Architecture
//!
//! ```text
//! Kafka topic         Validator          Transformer         Postgres
//! ┌──────────┐       ┌──────────┐       ┌──────────┐       ┌──────────┐
//! │ lmnh     │──────▶│ rules    │──────▶│ review / │──────▶│ review   │
//! │          │       │          │       │ incident │       │ incident │
//! └──────────┘       └──────────┘       └──────────┘       └──────────┘
//!                          │
//!                          ▼
//!                    dropped + logged
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use museum_pipeline::{EventProcessor, MuseumConsumer, PipelineConfig, Transformer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!
//!     let consumer = MuseumConsumer::new(config.kafka.clone())?;
//!     consumer.subscribe()?;
//!
//!     // Transform only; attach a store with `with_store` to load
//!     let processor = EventProcessor::new(Transformer::default());
//!     consumer.run(&processor).await;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod event;
pub mod repository;
pub mod transform;
pub mod validator;

pub use config::{
    ConfigError, ConnectionConfig, DatabaseConfig, DatabaseTarget, KafkaConfig, LoggingConfig,
    PipelineConfig, SaslConfig, SaslMechanism, SecurityProtocol, ValidationConfig,
};
pub use consumer::{
    ConsumerError, EventProcessor, IncomingMessage, LoadOptions, MessageMetadata,
    MessageOutcome, MuseumConsumer,
};
pub use event::{DecodeError, RawEvent};
pub use repository::{PgStore, RecordStore, StoreError};
pub use transform::{IncidentRecord, Record, ReviewRecord, Transformer};
pub use validator::{EventKind, Rejection, ValidEvent, Validator};
