use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Record headers are an ordered sequence, not a map: duplicate names are
/// legal and order is preserved end to end.
pub type Header = (String, Vec<u8>);

/// An immutable record as read back from the broker. Partition and offset are
/// broker-assigned; offsets are dense and monotonic per partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Payload as UTF-8, for handlers working with text payloads.
    pub fn value_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// A record on its way to the broker: no partition or offset yet. Built with
/// the chained `with_*` setters; the producer resolves the partition (explicit
/// partition wins, then key hash, then round-robin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: Vec<Header>,
    pub partition: Option<i32>,
}

impl PendingRecord {
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: value.into(),
            headers: Vec::new(),
            partition: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_record_builder() {
        let pending = PendingRecord::new("events", "payload")
            .with_key("user-1")
            .with_header("trace-id", "abc")
            .with_header("trace-id", "def")
            .with_partition(2);

        assert_eq!(pending.topic, "events");
        assert_eq!(pending.key.as_deref(), Some("user-1".as_bytes()));
        assert_eq!(pending.partition, Some(2));
        // Duplicate header names keep both entries, in insertion order
        assert_eq!(pending.headers.len(), 2);
        assert_eq!(pending.headers[0].1, b"abc");
        assert_eq!(pending.headers[1].1, b"def");
    }
}
