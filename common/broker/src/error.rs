use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),

    #[error("unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("transient broker error: {0}")]
    TransientIo(String),

    #[error(
        "producer fenced: client epoch {client_epoch} is stale, broker has epoch {broker_epoch}"
    )]
    ProducerFenced { client_epoch: u32, broker_epoch: u32 },

    #[error("out of order sequence number: expected {expected}, got {got}")]
    SequenceOutOfOrder { expected: u64, got: u64 },

    #[error("topic {0} already exists")]
    TopicExists(String),

    #[error("no open transaction for producer {0}")]
    NoOpenTransaction(Uuid),

    #[error("transaction already open for producer {0}")]
    TransactionAlreadyOpen(Uuid),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl BrokerError {
    /// Transient errors are safe to retry with unchanged state (including an
    /// unchanged sequence number). Everything else is either fatal to the
    /// producer session or a caller bug.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::TransientIo(_))
    }
}
