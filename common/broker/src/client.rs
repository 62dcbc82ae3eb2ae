use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::record::{PendingRecord, Record};
use crate::topic::TopicSpec;
use crate::types::{Partition, PartitionAssignment, PartitionOffset};

/// One logical producer identity. The id is stable for the lifetime of a
/// producer session; the epoch increments whenever the session fences itself
/// (or is fenced by the broker), invalidating any in-flight state from the
/// previous epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProducerIdentity {
    pub producer_id: Uuid,
    pub epoch: u32,
}

/// Idempotency metadata attached to an append. Sequence numbers are strictly
/// increasing per (producer, partition); the broker uses them to deduplicate
/// client-side retries of an append whose ack was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendSequencing {
    pub identity: ProducerIdentity,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// See every record, including aborted and still-pending transactional
    /// ones.
    ReadUncommitted,
    /// See only committed records; never read past the first record of a
    /// transaction that is still open.
    #[default]
    ReadCommitted,
}

#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub record: PendingRecord,
    /// Target partition, resolved by the caller before the append.
    pub partition: i32,
    /// Present for idempotent and transactional appends, absent for plain
    /// fire-and-forget.
    pub sequencing: Option<AppendSequencing>,
    /// Transactional appends are invisible to read-committed fetches until
    /// the owning transaction commits.
    pub transactional: bool,
}

/// Abstraction over a partitioned append-only log.
///
/// Implementations are expected to absorb connection-level flakiness
/// themselves where they can, and surface what remains as
/// [`BrokerError::TransientIo`]. Offset arguments and return values follow
/// the log convention: `commit_offset` stores the *next* offset the group
/// should consume, and `fetch` returns the first visible record at or after
/// the requested offset.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn append(&self, req: AppendRequest) -> Result<PartitionOffset, BrokerError>;

    /// At most one open transaction per producer id. A begin with a stale
    /// epoch fails with [`BrokerError::ProducerFenced`].
    async fn begin_transaction(&self, identity: ProducerIdentity) -> Result<(), BrokerError>;

    /// Makes every record of the open transaction visible atomically: a
    /// read-committed consumer observes all of them or none, never a proper
    /// subset.
    async fn commit_transaction(&self, identity: ProducerIdentity) -> Result<(), BrokerError>;

    /// Marks every record of the open transaction aborted; they never become
    /// visible to read-committed consumers.
    async fn abort_transaction(&self, identity: ProducerIdentity) -> Result<(), BrokerError>;

    /// Assigns every partition of the topic to this (single-member) group and
    /// reports the offset each partition should resume from.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<PartitionAssignment>, BrokerError>;

    /// Next visible record at or after `offset`, or `None` when the consumer
    /// is caught up (or blocked behind an open transaction under
    /// read-committed isolation).
    async fn fetch(
        &self,
        partition: &Partition,
        offset: i64,
        isolation: IsolationLevel,
    ) -> Result<Option<Record>, BrokerError>;

    async fn commit_offset(
        &self,
        group: &str,
        partition: &Partition,
        next_offset: i64,
    ) -> Result<(), BrokerError>;

    async fn committed_offset(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, BrokerError>;

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError>;

    async fn topic_spec(&self, name: &str) -> Result<Option<TopicSpec>, BrokerError>;

    async fn partition_count(&self, topic: &str) -> Result<i32, BrokerError>;
}
