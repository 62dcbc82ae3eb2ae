//! Single-process broker implementing the full `BrokerClient` contract:
//! dense per-partition offsets, idempotent-producer sequence dedup, epoch
//! fencing, transactional visibility, and consumer-group offset storage.
//!
//! Used by the integration tests and the demo binary. Like a dev broker, it
//! auto-creates topics (with the default spec) on first use; explicit
//! provisioning through `relay::provision::ensure` remains the supported
//! path.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::client::{
    AppendRequest, BrokerClient, IsolationLevel, ProducerIdentity,
};
use crate::error::BrokerError;
use crate::record::Record;
use crate::topic::TopicSpec;
use crate::types::{Partition, PartitionAssignment, PartitionOffset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Committed,
    Pending,
    Aborted,
}

#[derive(Debug)]
struct LogEntry {
    record: Record,
    state: EntryState,
}

#[derive(Debug, Clone, Copy)]
struct SequenceState {
    epoch: u32,
    last_sequence: u64,
    last_offset: i64,
}

#[derive(Debug, Default)]
struct PartitionLog {
    entries: Vec<LogEntry>,
    // Per-producer idempotency state for this partition.
    sequences: HashMap<Uuid, SequenceState>,
}

#[derive(Debug)]
struct TopicState {
    spec: TopicSpec,
    partitions: Vec<PartitionLog>,
}

impl TopicState {
    fn new(spec: TopicSpec) -> Self {
        let partitions = (0..spec.partitions).map(|_| PartitionLog::default()).collect();
        Self { spec, partitions }
    }
}

#[derive(Debug)]
struct OpenTransaction {
    epoch: u32,
    // (topic, partition, offset) of every pending entry in append order.
    entries: Vec<(String, i32, i64)>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    transactions: HashMap<Uuid, OpenTransaction>,
    // Highest epoch seen per producer id; anything older is fenced.
    producer_epochs: HashMap<Uuid, u32>,
    // (group, topic, partition) -> next offset to consume.
    offsets: HashMap<(String, String, i32), i64>,
    // Fault injection, consumed one operation at a time.
    drop_acks: u32,
    fail_appends: u32,
    fail_commits: u32,
    commit_delay: Option<Duration>,
}

pub struct InMemoryBroker {
    state: Mutex<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// The next `n` appends are applied but acknowledged with a transient
    /// error, simulating a lost ack. This is the failure the idempotent
    /// producer exists for: the client retries and the broker must
    /// deduplicate.
    pub async fn drop_acks(&self, n: u32) {
        self.state.lock().await.drop_acks = n;
    }

    /// The next `n` appends fail with a transient error without being
    /// applied.
    pub async fn fail_appends(&self, n: u32) {
        self.state.lock().await.fail_appends = n;
    }

    /// The next `n` transaction commits fail with a transient error,
    /// leaving the transaction open (the producer must resolve it, normally
    /// by aborting).
    pub async fn fail_commits(&self, n: u32) {
        self.state.lock().await.fail_commits = n;
    }

    /// The next transaction commit stalls for `delay` before applying, so
    /// client-side commit timeouts can be exercised.
    pub async fn delay_commits(&self, delay: Duration) {
        self.state.lock().await.commit_delay = Some(delay);
    }

    /// Every record of a topic visible under the given isolation level,
    /// ordered by (partition, offset). Test helper.
    pub async fn visible_records(&self, topic: &str, isolation: IsolationLevel) -> Vec<Record> {
        let state = self.state.lock().await;
        let Some(topic_state) = state.topics.get(topic) else {
            return Vec::new();
        };
        let mut records = Vec::new();
        for log in &topic_state.partitions {
            for entry in &log.entries {
                if visible(entry.state, isolation) {
                    records.push(entry.record.clone());
                }
            }
        }
        records.sort_by_key(|r| (r.partition, r.offset));
        records
    }
}

fn visible(state: EntryState, isolation: IsolationLevel) -> bool {
    match isolation {
        IsolationLevel::ReadUncommitted => true,
        IsolationLevel::ReadCommitted => state == EntryState::Committed,
    }
}

impl BrokerState {
    fn topic_or_create(&mut self, name: &str) -> &mut TopicState {
        self.topics.entry(name.to_string()).or_insert_with(|| {
            debug!(topic = name, "auto-creating topic with default spec");
            TopicState::new(TopicSpec::new(name))
        })
    }

    /// Fencing check shared by sequenced appends and transaction operations.
    fn check_epoch(&mut self, identity: ProducerIdentity) -> Result<(), BrokerError> {
        let known = self
            .producer_epochs
            .entry(identity.producer_id)
            .or_insert(identity.epoch);
        if identity.epoch < *known {
            return Err(BrokerError::ProducerFenced {
                client_epoch: identity.epoch,
                broker_epoch: *known,
            });
        }
        *known = identity.epoch;
        Ok(())
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn append(&self, req: AppendRequest) -> Result<PartitionOffset, BrokerError> {
        let mut state = self.state.lock().await;

        if state.fail_appends > 0 {
            state.fail_appends -= 1;
            return Err(BrokerError::TransientIo(
                "injected append failure".to_string(),
            ));
        }

        if req.transactional && req.sequencing.is_none() {
            return Err(BrokerError::InvalidRequest(
                "transactional append requires a producer identity".to_string(),
            ));
        }

        if let Some(seq) = req.sequencing {
            state.check_epoch(seq.identity)?;
            if req.transactional {
                match state.transactions.get(&seq.identity.producer_id) {
                    Some(txn) if txn.epoch == seq.identity.epoch => {}
                    _ => return Err(BrokerError::NoOpenTransaction(seq.identity.producer_id)),
                }
            }
        }

        let topic = req.record.topic.clone();
        let topic_state = state.topic_or_create(&topic);
        let partition_count = topic_state.spec.partitions;
        if req.partition < 0 || req.partition >= partition_count {
            return Err(BrokerError::UnknownPartition {
                topic,
                partition: req.partition,
            });
        }
        let log = &mut topic_state.partitions[req.partition as usize];

        // Idempotency: a replay of the last accepted sequence is acknowledged
        // with its original offset and appends nothing; a gap is a client bug.
        // Checked in its own scope so the log borrow ends before the
        // duplicate-ack path touches broker state again.
        let duplicate_offset = if let Some(seq) = req.sequencing {
            match log.sequences.get(&seq.identity.producer_id) {
                Some(st) if st.epoch == seq.identity.epoch => {
                    if seq.sequence == st.last_sequence {
                        Some(st.last_offset)
                    } else if seq.sequence == st.last_sequence + 1 {
                        None
                    } else {
                        return Err(BrokerError::SequenceOutOfOrder {
                            expected: st.last_sequence + 1,
                            got: seq.sequence,
                        });
                    }
                }
                // First append at this epoch on this partition.
                _ if seq.sequence == 0 => None,
                _ => {
                    return Err(BrokerError::SequenceOutOfOrder {
                        expected: 0,
                        got: seq.sequence,
                    });
                }
            }
        } else {
            None
        };
        if let Some(offset) = duplicate_offset {
            return duplicate_ack(&mut state, &topic, req.partition, offset);
        }

        let offset = log.entries.len() as i64;
        let record = Record {
            topic: topic.clone(),
            partition: req.partition,
            offset,
            key: req.record.key,
            value: req.record.value,
            headers: req.record.headers,
            timestamp: Utc::now(),
        };
        log.entries.push(LogEntry {
            record,
            state: if req.transactional {
                EntryState::Pending
            } else {
                EntryState::Committed
            },
        });
        if let Some(seq) = req.sequencing {
            log.sequences.insert(
                seq.identity.producer_id,
                SequenceState {
                    epoch: seq.identity.epoch,
                    last_sequence: seq.sequence,
                    last_offset: offset,
                },
            );
            if req.transactional {
                if let Some(txn) = state.transactions.get_mut(&seq.identity.producer_id) {
                    txn.entries.push((topic.clone(), req.partition, offset));
                }
            }
        }

        if state.drop_acks > 0 {
            state.drop_acks -= 1;
            return Err(BrokerError::TransientIo(
                "append applied but ack dropped".to_string(),
            ));
        }

        Ok(PartitionOffset::new(
            Partition::new(topic, req.partition),
            offset,
        ))
    }

    async fn begin_transaction(&self, identity: ProducerIdentity) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check_epoch(identity)?;
        if state.transactions.contains_key(&identity.producer_id) {
            return Err(BrokerError::TransactionAlreadyOpen(identity.producer_id));
        }
        state.transactions.insert(
            identity.producer_id,
            OpenTransaction {
                epoch: identity.epoch,
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    async fn commit_transaction(&self, identity: ProducerIdentity) -> Result<(), BrokerError> {
        let (fail, delay) = {
            let mut state = self.state.lock().await;
            let fail = if state.fail_commits > 0 {
                state.fail_commits -= 1;
                true
            } else {
                false
            };
            (fail, state.commit_delay.take())
        };
        // Stall outside the lock so concurrent operations keep working.
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(BrokerError::TransientIo(
                "injected commit failure".to_string(),
            ));
        }
        self.finish_transaction(identity, EntryState::Committed).await
    }

    async fn abort_transaction(&self, identity: ProducerIdentity) -> Result<(), BrokerError> {
        self.finish_transaction(identity, EntryState::Aborted).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<PartitionAssignment>, BrokerError> {
        let mut state = self.state.lock().await;
        let partition_count = state.topic_or_create(topic).spec.partitions;
        let assignments = (0..partition_count)
            .map(|p| {
                let next = state
                    .offsets
                    .get(&(group.to_string(), topic.to_string(), p))
                    .copied()
                    .unwrap_or(0);
                PartitionAssignment::new(Partition::new(topic, p), next)
            })
            .collect();
        Ok(assignments)
    }

    async fn fetch(
        &self,
        partition: &Partition,
        offset: i64,
        isolation: IsolationLevel,
    ) -> Result<Option<Record>, BrokerError> {
        let state = self.state.lock().await;
        let topic_state = state
            .topics
            .get(partition.topic())
            .ok_or_else(|| BrokerError::UnknownTopic(partition.topic().to_string()))?;
        let index = partition.partition_number();
        if index < 0 || index >= topic_state.spec.partitions {
            return Err(BrokerError::UnknownPartition {
                topic: partition.topic().to_string(),
                partition: index,
            });
        }
        let log = &topic_state.partitions[index as usize];
        let start = offset.max(0) as usize;
        for entry in log.entries.iter().skip(start) {
            match (isolation, entry.state) {
                (IsolationLevel::ReadUncommitted, _) => return Ok(Some(entry.record.clone())),
                (IsolationLevel::ReadCommitted, EntryState::Committed) => {
                    return Ok(Some(entry.record.clone()))
                }
                (IsolationLevel::ReadCommitted, EntryState::Aborted) => continue,
                // Never read past an open transaction: a later committed
                // record must not become visible before an earlier pending
                // one resolves.
                (IsolationLevel::ReadCommitted, EntryState::Pending) => return Ok(None),
            }
        }
        Ok(None)
    }

    async fn commit_offset(
        &self,
        group: &str,
        partition: &Partition,
        next_offset: i64,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.offsets.insert(
            (
                group.to_string(),
                partition.topic().to_string(),
                partition.partition_number(),
            ),
            next_offset,
        );
        Ok(())
    }

    async fn committed_offset(
        &self,
        group: &str,
        partition: &Partition,
    ) -> Result<Option<i64>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state
            .offsets
            .get(&(
                group.to_string(),
                partition.topic().to_string(),
                partition.partition_number(),
            ))
            .copied())
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), BrokerError> {
        spec.validate().map_err(BrokerError::InvalidRequest)?;
        let mut state = self.state.lock().await;
        if state.topics.contains_key(&spec.name) {
            return Err(BrokerError::TopicExists(spec.name.clone()));
        }
        state
            .topics
            .insert(spec.name.clone(), TopicState::new(spec.clone()));
        Ok(())
    }

    async fn topic_spec(&self, name: &str) -> Result<Option<TopicSpec>, BrokerError> {
        let state = self.state.lock().await;
        Ok(state.topics.get(name).map(|t| t.spec.clone()))
    }

    async fn partition_count(&self, topic: &str) -> Result<i32, BrokerError> {
        let mut state = self.state.lock().await;
        Ok(state.topic_or_create(topic).spec.partitions)
    }
}

impl InMemoryBroker {
    async fn finish_transaction(
        &self,
        identity: ProducerIdentity,
        terminal: EntryState,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.check_epoch(identity)?;
        let txn = state
            .transactions
            .remove(&identity.producer_id)
            .ok_or(BrokerError::NoOpenTransaction(identity.producer_id))?;
        if txn.epoch != identity.epoch {
            // Reinstate before failing so the owning epoch can still resolve it.
            let fenced = BrokerError::ProducerFenced {
                client_epoch: identity.epoch,
                broker_epoch: txn.epoch,
            };
            state.transactions.insert(identity.producer_id, txn);
            return Err(fenced);
        }
        // Single lock held throughout: the whole set flips atomically, so a
        // read-committed consumer can never observe a proper subset.
        for (topic, partition, offset) in txn.entries {
            if let Some(topic_state) = state.topics.get_mut(&topic) {
                if let Some(entry) = topic_state.partitions[partition as usize]
                    .entries
                    .get_mut(offset as usize)
                {
                    entry.state = terminal;
                }
            }
        }
        Ok(())
    }
}

/// Acknowledge a duplicate append, honoring the drop-ack fault injection the
/// same way a first-time append would.
fn duplicate_ack(
    state: &mut BrokerState,
    topic: &str,
    partition: i32,
    offset: i64,
) -> Result<PartitionOffset, BrokerError> {
    if state.drop_acks > 0 {
        state.drop_acks -= 1;
        return Err(BrokerError::TransientIo(
            "append applied but ack dropped".to_string(),
        ));
    }
    Ok(PartitionOffset::new(Partition::new(topic, partition), offset))
}
