//! Reliable delivery layer between application code and a partitioned,
//! append-only log broker.
//!
//! The producer side ([`producer::ProducerClient`]) adds idempotent appends
//! (per-partition sequence numbers deduplicated by the broker) and atomic
//! multi-record transactions on top of the raw `BrokerClient` boundary. The
//! consumer side ([`pipeline::ConsumptionPipeline`]) pulls records per
//! partition in strict offset order, retries handler failures with bounded
//! backoff, and diverts poison records to a `<topic>.DLT` dead-letter topic
//! instead of blocking the partition forever.
//!
//! Delivery is at-least-once: offsets commit only after a record is handled,
//! so a crash between handling and commit causes redelivery. Handlers must
//! tolerate that; this layer does not make consumer-side effects idempotent.

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod metrics_const;
pub mod pipeline;
pub mod producer;
pub mod provision;
pub mod retry;

pub use config::{PipelineConfig, ProducerConfig};
pub use dead_letter::{dead_letter_topic, DeadLetterEnvelope, DeadLetterRouter};
pub use error::{DeadLetterError, PipelineError, ProvisionError, SendError};
pub use pipeline::{ConsumptionPipeline, Handler, PipelineHandle};
pub use producer::{ProducerClient, Transaction};
pub use retry::{HandlerError, RetryDecision, RetryPolicy};
