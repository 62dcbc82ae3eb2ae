use common_broker::{BrokerError, TopicSpec};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("send to topic {topic} failed after {attempts} attempts: {source}")]
    SendFailed {
        topic: String,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// The broker reported a newer epoch for this producer id. Fatal to the
    /// session: the caller needs a fresh producer, not a retry.
    #[error("producer fenced by broker: {source}")]
    ProducerFenced {
        #[source]
        source: BrokerError,
    },

    /// The broker saw a sequence gap or regression, which means the client
    /// state was corrupt. The session has fenced itself (epoch bumped,
    /// sequences reset) before surfacing this.
    #[error("producer sequence error, session fenced: {source}")]
    SequenceError {
        #[source]
        source: BrokerError,
    },

    #[error("a transaction is already open on this producer session")]
    TransactionInUse,

    #[error("transaction is no longer open")]
    TransactionClosed,

    #[error("transaction commit timed out after {timeout_ms}ms; transaction aborted")]
    CommitTimeout { timeout_ms: u64 },

    #[error("broker error: {0}")]
    Broker(BrokerError),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid topic spec for {name}: {reason}")]
    InvalidSpec { name: String, reason: String },

    /// Never auto-resolved: partition count changes rekey key-to-partition
    /// routing.
    #[error("topic {name} exists with a conflicting spec: existing {existing:?}, requested {requested:?}")]
    SpecMismatch {
        name: String,
        existing: TopicSpec,
        requested: TopicSpec,
    },

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// A dead-letter publish that failed even after the router's own retries.
/// The one error this layer never absorbs quietly: losing it would lose the
/// poison record.
#[derive(Debug, Error)]
#[error("dead letter publish to {dlt_topic} failed after {attempts} attempts: {source}")]
pub struct DeadLetterError {
    pub dlt_topic: String,
    pub attempts: u32,
    #[source]
    pub source: SendError,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to subscribe to {topic} for group {group}: {source}")]
    Subscribe {
        topic: String,
        group: String,
        #[source]
        source: BrokerError,
    },

    #[error("fetch on {partition} failed: {source}")]
    Fetch {
        partition: String,
        #[source]
        source: BrokerError,
    },

    #[error("offset commit on {partition} failed: {source}")]
    OffsetCommit {
        partition: String,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    DeadLetterFailed(#[from] DeadLetterError),

    #[error("partition worker panicked: {0}")]
    WorkerPanic(String),
}
