//! Producer client: idempotent appends and atomic multi-record transactions
//! on top of the raw broker boundary.
//!
//! Every idempotent append carries `(producer_id, epoch, sequence)`, with
//! sequences strictly increasing per partition. A transient append failure is
//! retried with the *same* sequence number, so a lost ack can never become a
//! duplicate record. Fencing (stale epoch reported by the broker) is fatal to
//! the session and surfaced, never papered over with stale state.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use common_broker::{
    AppendRequest, AppendSequencing, BrokerClient, BrokerError, PartitionOffset, PendingRecord,
    ProducerIdentity,
};
use dashmap::DashMap;
use serde::Serialize;
use siphasher::sip::SipHasher13;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::ProducerConfig;
use crate::error::SendError;
use crate::metrics_const::{
    APPENDS_SENT, APPEND_RETRIES, PRODUCER_FENCED, TRANSACTIONS_ABORTED, TRANSACTIONS_COMMITTED,
};

pub struct ProducerClient<B: BrokerClient + 'static> {
    broker: Arc<B>,
    producer_id: Uuid,
    epoch: AtomicU32,
    config: ProducerConfig,
    // Next sequence per (topic, partition). Each slot has its own lock: one
    // in-flight append per partition per session, while other partitions
    // proceed in parallel.
    sequences: DashMap<(String, i32), Arc<Mutex<u64>>>,
    round_robin: AtomicUsize,
    // Exclusive slot for the (at most one) open transaction.
    txn_slot: Mutex<()>,
}

impl<B: BrokerClient + 'static> ProducerClient<B> {
    pub fn new(broker: Arc<B>, config: ProducerConfig) -> Self {
        Self::with_producer_id(broker, config, Uuid::new_v4())
    }

    /// A producer id stable across restarts keeps idempotency state on the
    /// broker side; callers that want that pass their own id.
    pub fn with_producer_id(broker: Arc<B>, config: ProducerConfig, producer_id: Uuid) -> Self {
        Self {
            broker,
            producer_id,
            epoch: AtomicU32::new(0),
            config,
            sequences: DashMap::new(),
            round_robin: AtomicUsize::new(0),
            txn_slot: Mutex::new(()),
        }
    }

    pub fn producer_id(&self) -> Uuid {
        self.producer_id
    }

    pub fn identity(&self) -> ProducerIdentity {
        ProducerIdentity {
            producer_id: self.producer_id,
            epoch: self.epoch.load(Ordering::SeqCst),
        }
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Idempotent send: at most one visible record per logical send, even
    /// when transient broker failures force client-side retries.
    pub async fn send(&self, pending: PendingRecord) -> Result<PartitionOffset, SendError> {
        self.append_with_retry(pending, false).await
    }

    /// JSON convenience over [`send`](Self::send); serialization failures are
    /// fatal, not retried.
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &T,
    ) -> Result<PartitionOffset, SendError> {
        let value = serde_json::to_vec(payload)?;
        let mut pending = PendingRecord::new(topic, value);
        if let Some(key) = key {
            pending = pending.with_key(key.as_bytes().to_vec());
        }
        self.send(pending).await
    }

    /// Open a transaction. At most one per session; a concurrent open
    /// transaction yields [`SendError::TransactionInUse`] instead of racing.
    pub async fn begin_transaction(&self) -> Result<Transaction<'_, B>, SendError> {
        let slot = self
            .txn_slot
            .try_lock()
            .map_err(|_| SendError::TransactionInUse)?;
        let identity = self.identity();
        match self.broker.begin_transaction(identity).await {
            Ok(()) => Ok(Transaction {
                producer: self,
                identity,
                state: TxState::Begun,
                _slot: slot,
            }),
            Err(source @ BrokerError::ProducerFenced { .. }) => {
                metrics::counter!(PRODUCER_FENCED).increment(1);
                Err(SendError::ProducerFenced { source })
            }
            Err(source) => Err(SendError::Broker(source)),
        }
    }

    /// Send a batch atomically: begin, append each record, commit. Any
    /// failure aborts the whole batch; a read-committed consumer sees all of
    /// it or none of it.
    pub async fn send_all_transactional(
        &self,
        batch: impl IntoIterator<Item = PendingRecord>,
    ) -> Result<(), SendError> {
        let txn = self.begin_transaction().await?;
        for pending in batch {
            if let Err(e) = txn.send(pending).await {
                warn!(error = %e, "transactional send failed, aborting transaction");
                if let Err(abort_err) = txn.abort().await {
                    warn!(error = %abort_err, "abort after failed transactional send also failed");
                }
                return Err(e);
            }
        }
        txn.commit().await
    }

    async fn append_with_retry(
        &self,
        pending: PendingRecord,
        transactional: bool,
    ) -> Result<PartitionOffset, SendError> {
        let partition = self
            .resolve_partition(&pending)
            .await
            .map_err(SendError::Broker)?;
        let topic = pending.topic.clone();

        let slot = self
            .sequences
            .entry((topic.clone(), partition))
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();
        // Held across the append: sequence numbers cannot be assigned out of
        // order, so there is one in-flight append per partition per session.
        let mut sequence: MutexGuard<'_, u64> = slot.lock().await;

        let request = AppendRequest {
            record: pending,
            partition,
            sequencing: Some(AppendSequencing {
                identity: self.identity(),
                sequence: *sequence,
            }),
            transactional,
        };

        let max_attempts = self.config.max_send_attempts.max(1);
        let mut last_error = BrokerError::TransientIo("no append attempted".to_string());
        for attempt in 1..=max_attempts {
            match self.broker.append(request.clone()).await {
                Ok(offset) => {
                    *sequence += 1;
                    metrics::counter!(APPENDS_SENT).increment(1);
                    return Ok(offset);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        topic = %topic,
                        partition,
                        attempt,
                        error = %e,
                        "transient append failure, retrying with same sequence"
                    );
                    metrics::counter!(APPEND_RETRIES).increment(1);
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.send_retry_backoff()).await;
                    }
                }
                Err(source @ BrokerError::ProducerFenced { .. }) => {
                    error!(
                        producer_id = %self.producer_id,
                        error = %source,
                        "producer fenced by broker, session requires replacement"
                    );
                    metrics::counter!(PRODUCER_FENCED).increment(1);
                    return Err(SendError::ProducerFenced { source });
                }
                Err(source @ BrokerError::SequenceOutOfOrder { .. }) => {
                    // Our own sequencing state was wrong. Fence the session
                    // so the next send starts clean at the new epoch.
                    let epoch = self.advance_epoch();
                    error!(
                        producer_id = %self.producer_id,
                        epoch,
                        error = %source,
                        "sequence error, producer session fenced itself"
                    );
                    metrics::counter!(PRODUCER_FENCED).increment(1);
                    return Err(SendError::SequenceError { source });
                }
                Err(source) => return Err(SendError::Broker(source)),
            }
        }

        Err(SendError::SendFailed {
            topic,
            attempts: max_attempts,
            source: last_error,
        })
    }

    async fn resolve_partition(&self, pending: &PendingRecord) -> Result<i32, BrokerError> {
        if let Some(partition) = pending.partition {
            return Ok(partition);
        }
        let count = self.broker.partition_count(&pending.topic).await?;
        match &pending.key {
            Some(key) => Ok(partition_for_key(key, count)),
            None => Ok((self.round_robin.fetch_add(1, Ordering::Relaxed) % count as usize) as i32),
        }
    }

    /// Invalidate the session's idempotency state: bump the epoch, restart
    /// every partition's sequence at zero.
    fn advance_epoch(&self) -> u32 {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.sequences.clear();
        epoch
    }
}

/// Keyed records always land on the same partition for a given partition
/// count, preserving per-key ordering.
fn partition_for_key(key: &[u8], partition_count: i32) -> i32 {
    let mut hasher = SipHasher13::new();
    hasher.write(key);
    (hasher.finish() % partition_count as u64) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Begun,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

/// An open transaction, holding the session's exclusive transaction slot.
/// Resolved by [`commit`](Transaction::commit) or
/// [`abort`](Transaction::abort); dropping it unresolved aborts it.
pub struct Transaction<'a, B: BrokerClient + 'static> {
    producer: &'a ProducerClient<B>,
    identity: ProducerIdentity,
    state: TxState,
    _slot: MutexGuard<'a, ()>,
}

impl<B: BrokerClient + 'static> Transaction<'_, B> {
    /// Append inside the transaction. The record stays invisible to
    /// read-committed consumers until commit.
    pub async fn send(&self, pending: PendingRecord) -> Result<PartitionOffset, SendError> {
        if self.state != TxState::Begun {
            return Err(SendError::TransactionClosed);
        }
        self.producer.append_with_retry(pending, true).await
    }

    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &T,
    ) -> Result<PartitionOffset, SendError> {
        let value = serde_json::to_vec(payload)?;
        let mut pending = PendingRecord::new(topic, value);
        if let Some(key) = key {
            pending = pending.with_key(key.as_bytes().to_vec());
        }
        self.send(pending).await
    }

    /// Make every record of the transaction visible, atomically. A commit
    /// that fails or times out is aborted: an unconfirmed commit is never
    /// reported as success.
    pub async fn commit(mut self) -> Result<(), SendError> {
        if self.state != TxState::Begun {
            return Err(SendError::TransactionClosed);
        }
        self.state = TxState::Committing;
        let timeout = self.producer.config.transaction_timeout();
        match tokio::time::timeout(
            timeout,
            self.producer.broker.commit_transaction(self.identity),
        )
        .await
        {
            Ok(Ok(())) => {
                self.state = TxState::Committed;
                metrics::counter!(TRANSACTIONS_COMMITTED).increment(1);
                debug!(producer_id = %self.producer.producer_id, "transaction committed");
                Ok(())
            }
            Ok(Err(source)) => {
                warn!(error = %source, "transaction commit failed, aborting");
                self.abort_inner().await;
                match source {
                    fenced @ BrokerError::ProducerFenced { .. } => {
                        Err(SendError::ProducerFenced { source: fenced })
                    }
                    other => Err(SendError::Broker(other)),
                }
            }
            Err(_elapsed) => {
                warn!(timeout_ms = self.producer.config.transaction_timeout_ms, "transaction commit timed out, aborting");
                self.abort_inner().await;
                Err(SendError::CommitTimeout {
                    timeout_ms: self.producer.config.transaction_timeout_ms,
                })
            }
        }
    }

    /// Abort: none of the transaction's records ever become visible.
    pub async fn abort(mut self) -> Result<(), SendError> {
        if self.state != TxState::Begun {
            return Err(SendError::TransactionClosed);
        }
        self.abort_inner().await;
        Ok(())
    }

    async fn abort_inner(&mut self) {
        self.state = TxState::Aborting;
        if let Err(e) = self
            .producer
            .broker
            .abort_transaction(self.identity)
            .await
        {
            warn!(error = %e, "failed to abort transaction on broker");
        }
        self.state = TxState::Aborted;
        // Session sequences reset on abort; the epoch bump keeps the broker's
        // idempotency state consistent with the restart at zero.
        self.producer.advance_epoch();
        metrics::counter!(TRANSACTIONS_ABORTED).increment(1);
    }
}

impl<B: BrokerClient + 'static> Drop for Transaction<'_, B> {
    fn drop(&mut self) {
        if matches!(self.state, TxState::Committed | TxState::Aborted) {
            return;
        }
        warn!(
            producer_id = %self.producer.producer_id,
            "transaction dropped while unresolved, aborting"
        );
        self.producer.advance_epoch();
        let broker = Arc::clone(&self.producer.broker);
        let identity = self.identity;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = broker.abort_transaction(identity).await {
                    error!(error = %e, "failed to abort dropped transaction");
                }
            });
        } else {
            error!("no runtime available to abort dropped transaction; broker must time it out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_broker::{InMemoryBroker, IsolationLevel};

    fn producer() -> ProducerClient<InMemoryBroker> {
        let config = ProducerConfig {
            send_retry_backoff_ms: 5,
            ..ProducerConfig::default()
        };
        ProducerClient::new(Arc::new(InMemoryBroker::new()), config)
    }

    #[test]
    fn test_partition_for_key_is_stable() {
        let a = partition_for_key(b"user-1", 3);
        let b = partition_for_key(b"user-1", 3);
        assert_eq!(a, b);
        assert!((0..3).contains(&a));
    }

    #[tokio::test]
    async fn test_keyed_sends_land_on_one_partition() {
        let producer = producer();
        let mut partitions = std::collections::HashSet::new();
        for _ in 0..5 {
            let po = producer
                .send(PendingRecord::new("events", "v").with_key("user-1"))
                .await
                .unwrap();
            partitions.insert(po.partition_number());
        }
        assert_eq!(partitions.len(), 1);
    }

    #[tokio::test]
    async fn test_transparent_retry_of_transient_failures() {
        let producer = producer();
        producer.broker().fail_appends(2).await;

        let po = producer
            .send(PendingRecord::new("events", "v").with_partition(0))
            .await
            .unwrap();
        assert_eq!(po.offset(), 0);
        assert_eq!(
            producer
                .broker()
                .visible_records("events", IsolationLevel::ReadCommitted)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_retries_exhausted_surface_send_failed() {
        let producer = producer();
        producer.broker().fail_appends(100).await;

        let err = producer
            .send(PendingRecord::new("events", "v").with_partition(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::SendFailed { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_transaction_is_rejected() {
        let producer = producer();
        let _txn = producer.begin_transaction().await.unwrap();
        assert!(matches!(
            producer.begin_transaction().await,
            Err(SendError::TransactionInUse)
        ));
    }

    #[tokio::test]
    async fn test_transaction_slot_frees_after_commit() {
        let producer = producer();
        let txn = producer.begin_transaction().await.unwrap();
        txn.send(PendingRecord::new("events", "v").with_partition(0))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        // Slot is free again; a new transaction starts cleanly.
        let txn = producer.begin_transaction().await.unwrap();
        txn.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_commit_aborts_transaction() {
        let producer = producer();
        let txn = producer.begin_transaction().await.unwrap();
        txn.send(PendingRecord::new("events", "v").with_partition(0))
            .await
            .unwrap();

        producer.broker().fail_commits(1).await;
        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, SendError::Broker(_)));

        // The unconfirmed commit was aborted, never reported as success:
        // nothing is visible, and the record sits aborted in the log.
        assert!(producer
            .broker()
            .visible_records("events", IsolationLevel::ReadCommitted)
            .await
            .is_empty());
        assert_eq!(
            producer
                .broker()
                .visible_records("events", IsolationLevel::ReadUncommitted)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_commit_timeout_aborts_transaction() {
        let config = ProducerConfig {
            transaction_timeout_ms: 50,
            ..ProducerConfig::default()
        };
        let producer = ProducerClient::new(Arc::new(InMemoryBroker::new()), config);
        let txn = producer.begin_transaction().await.unwrap();
        txn.send(PendingRecord::new("events", "v").with_partition(0))
            .await
            .unwrap();

        producer
            .broker()
            .delay_commits(std::time::Duration::from_millis(500))
            .await;
        let err = txn.commit().await.unwrap_err();
        assert!(matches!(err, SendError::CommitTimeout { timeout_ms: 50 }));
        assert!(producer
            .broker()
            .visible_records("events", IsolationLevel::ReadCommitted)
            .await
            .is_empty());

        // The session fenced itself on abort and keeps working.
        producer
            .send(PendingRecord::new("events", "after").with_partition(0))
            .await
            .unwrap();
        let visible = producer
            .broker()
            .visible_records("events", IsolationLevel::ReadCommitted)
            .await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].value, b"after");
    }

    #[tokio::test]
    async fn test_abort_resets_session_sequences() {
        let producer = producer();
        let txn = producer.begin_transaction().await.unwrap();
        txn.send(PendingRecord::new("events", "v").with_partition(0))
            .await
            .unwrap();
        txn.abort().await.unwrap();

        // Post-abort sends start a fresh epoch and still work.
        producer
            .send(PendingRecord::new("events", "v2").with_partition(0))
            .await
            .unwrap();
        let visible = producer
            .broker()
            .visible_records("events", IsolationLevel::ReadCommitted)
            .await;
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].value, b"v2");
    }
}
