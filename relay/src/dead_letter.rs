//! Dead-letter routing: when retries for a record are exhausted, the record
//! plus failure metadata is re-published to `<topic>.DLT` so the source
//! partition can move on and the record stays available for inspection and
//! replay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common_broker::{BrokerClient, PartitionOffset, PendingRecord, Record};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{DeadLetterError, SendError};
use crate::metrics_const::{DEAD_LETTERS_PUBLISHED, DEAD_LETTER_PUBLISH_FAILURES};
use crate::producer::ProducerClient;

/// Exact, case-preserving suffix. Operational tooling watches for it; never
/// change the casing.
pub const DEAD_LETTER_SUFFIX: &str = ".DLT";

pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}{DEAD_LETTER_SUFFIX}")
}

/// The dead-letter record's value: the original record plus everything an
/// operator needs to diagnose and replay it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    pub fn from_record(record: &Record, failure_reason: &str, attempt_count: u32) -> Self {
        Self {
            original_topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key.clone(),
            value: record.value.clone(),
            failure_reason: failure_reason.to_string(),
            attempt_count,
            failed_at: Utc::now(),
        }
    }
}

/// Publishes dead-letter envelopes in plain (non-transactional) mode, so
/// dead-lettering never participates in, or gets blocked by, a caller's
/// transaction. Has its own bounded retry on top of the producer's: losing a
/// poison record is the one failure this layer must be loud about.
pub struct DeadLetterRouter<B: BrokerClient + 'static> {
    producer: ProducerClient<B>,
    max_publish_attempts: u32,
    publish_backoff: Duration,
}

impl<B: BrokerClient + 'static> DeadLetterRouter<B> {
    pub fn new(
        producer: ProducerClient<B>,
        max_publish_attempts: u32,
        publish_backoff: Duration,
    ) -> Self {
        Self {
            producer,
            max_publish_attempts: max_publish_attempts.max(1),
            publish_backoff,
        }
    }

    pub async fn route(
        &self,
        record: &Record,
        failure_reason: &str,
        attempt_count: u32,
    ) -> Result<PartitionOffset, DeadLetterError> {
        let dlt_topic = dead_letter_topic(&record.topic);
        let envelope = DeadLetterEnvelope::from_record(record, failure_reason, attempt_count);
        let value = match serde_json::to_vec(&envelope) {
            Ok(value) => value,
            Err(e) => {
                // Plain-struct serialization failing is a bug, but it still
                // must not pass silently.
                return Err(self.give_up(&dlt_topic, 0, SendError::Serialization(e)));
            }
        };
        let mut pending = PendingRecord::new(&dlt_topic, value);
        if let Some(key) = &record.key {
            // Keep the original key so replays land on a stable partition.
            pending = pending.with_key(key.clone());
        }

        let mut last_error = None;
        for attempt in 1..=self.max_publish_attempts {
            match self.producer.send(pending.clone()).await {
                Ok(offset) => {
                    info!(
                        dlt_topic = %dlt_topic,
                        original_topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt_count,
                        "record routed to dead letter topic"
                    );
                    metrics::counter!(DEAD_LETTERS_PUBLISHED).increment(1);
                    return Ok(offset);
                }
                Err(e) => {
                    warn!(
                        dlt_topic = %dlt_topic,
                        attempt,
                        error = %e,
                        "dead letter publish failed"
                    );
                    last_error = Some(e);
                    if attempt < self.max_publish_attempts {
                        tokio::time::sleep(self.publish_backoff).await;
                    }
                }
            }
        }

        let source = last_error.unwrap_or(SendError::Broker(
            common_broker::BrokerError::TransientIo("no publish attempted".to_string()),
        ));
        Err(self.give_up(&dlt_topic, self.max_publish_attempts, source))
    }

    fn give_up(&self, dlt_topic: &str, attempts: u32, source: SendError) -> DeadLetterError {
        error!(
            dlt_topic = %dlt_topic,
            attempts,
            error = %source,
            "dead letter publish exhausted retries; record at risk of loss"
        );
        metrics::counter!(DEAD_LETTER_PUBLISH_FAILURES).increment(1);
        DeadLetterError {
            dlt_topic: dlt_topic.to_string(),
            attempts,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProducerConfig;
    use common_broker::{InMemoryBroker, IsolationLevel};
    use std::sync::Arc;

    #[test]
    fn test_dead_letter_topic_suffix_is_verbatim() {
        assert_eq!(dead_letter_topic("orders"), "orders.DLT");
        // Case-preserving on both sides of the suffix.
        assert_eq!(dead_letter_topic("Orders.v2"), "Orders.v2.DLT");
    }

    #[tokio::test]
    async fn test_route_publishes_envelope_with_original_record() {
        let broker = Arc::new(InMemoryBroker::new());
        let producer = ProducerClient::new(Arc::clone(&broker), ProducerConfig::default());
        let router = DeadLetterRouter::new(producer, 3, Duration::from_millis(5));

        let record = Record {
            topic: "orders".to_string(),
            partition: 1,
            offset: 42,
            key: Some(b"user-1".to_vec()),
            value: b"poison".to_vec(),
            headers: vec![],
            timestamp: Utc::now(),
        };
        router.route(&record, "handler gave up", 3).await.unwrap();

        let published = broker
            .visible_records("orders.DLT", IsolationLevel::ReadCommitted)
            .await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key.as_deref(), Some(b"user-1".as_ref()));

        let envelope: DeadLetterEnvelope = serde_json::from_slice(&published[0].value).unwrap();
        assert_eq!(envelope.original_topic, "orders");
        assert_eq!(envelope.offset, 42);
        assert_eq!(envelope.value, b"poison");
        assert_eq!(envelope.attempt_count, 3);
        assert_eq!(envelope.failure_reason, "handler gave up");
    }

    #[tokio::test]
    async fn test_route_retries_before_giving_up() {
        let broker = Arc::new(InMemoryBroker::new());
        let config = ProducerConfig {
            // One attempt per producer send, so the router's own retry is
            // what recovers here.
            max_send_attempts: 1,
            send_retry_backoff_ms: 1,
            ..ProducerConfig::default()
        };
        let producer = ProducerClient::new(Arc::clone(&broker), config);
        let router = DeadLetterRouter::new(producer, 3, Duration::from_millis(1));

        broker.fail_appends(2).await;
        let record = Record {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            key: None,
            value: b"poison".to_vec(),
            headers: vec![],
            timestamp: Utc::now(),
        };
        router.route(&record, "boom", 3).await.unwrap();
        assert_eq!(
            broker
                .visible_records("orders.DLT", IsolationLevel::ReadCommitted)
                .await
                .len(),
            1
        );
    }
}
