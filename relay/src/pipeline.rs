//! Consumption pipeline: one worker per assigned partition, each processing
//! records strictly sequentially in offset order.
//!
//! Per record the flow is `Pulled -> Processing -> {Succeeded | Retrying ->
//! Processing | DeadLettered}`. Offsets commit only after successful handling
//! (at-least-once); a record that keeps failing is retried per policy and
//! then diverted to the dead-letter topic, after which its offset commits so
//! the poison record cannot block the partition forever. A retrying record
//! blocks later records on the same partition by design: that is the
//! per-partition ordering guarantee, and the dead-letter bound is what keeps
//! the blocking finite.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_broker::{BrokerClient, IsolationLevel, Partition, Record};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::dead_letter::DeadLetterRouter;
use crate::error::PipelineError;
use crate::metrics_const::{RECORDS_DEAD_LETTERED, RECORDS_PROCESSED, RECORDS_RETRIED};
use crate::retry::{HandlerError, RetryDecision, RetryPolicy};

/// Business-logic handler for consumed records. Registered explicitly at
/// pipeline construction; one handler serves every partition of the topic.
///
/// Handlers must tolerate redelivery: a crash between handling and offset
/// commit replays the record.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError>;
}

/// A record under consumption, with the metadata the retry loop tracks for
/// it. Attempt counts live in memory only: a restarted consumer starts a
/// fresh retry budget.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub record: Record,
    pub attempt_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub group: String,
}

impl ConsumedMessage {
    fn new(record: Record, group: String) -> Self {
        Self {
            record,
            attempt_count: 0,
            first_seen_at: Utc::now(),
            group,
        }
    }
}

pub struct ConsumptionPipeline<B: BrokerClient + 'static> {
    broker: Arc<B>,
    handler: Arc<dyn Handler>,
    policy: RetryPolicy,
    router: Arc<DeadLetterRouter<B>>,
    config: PipelineConfig,
}

impl<B: BrokerClient + 'static> ConsumptionPipeline<B> {
    pub fn new(
        broker: Arc<B>,
        handler: Arc<dyn Handler>,
        policy: RetryPolicy,
        router: DeadLetterRouter<B>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            broker,
            handler,
            policy,
            router: Arc::new(router),
            config,
        }
    }

    /// Subscribe and spawn one worker per assigned partition. Partitions
    /// process in parallel with no cross-partition ordering.
    pub async fn start(self) -> Result<PipelineHandle, PipelineError> {
        let topic = self.config.consumer_topic.clone();
        let group = self.config.consumer_group.clone();
        let assignments = self
            .broker
            .subscribe(&topic, &group)
            .await
            .map_err(|source| PipelineError::Subscribe {
                topic: topic.clone(),
                group: group.clone(),
                source,
            })?;

        info!(
            topic = %topic,
            group = %group,
            partitions = assignments.len(),
            "starting consumption pipeline"
        );

        let token = CancellationToken::new();
        let workers = assignments
            .into_iter()
            .map(|assignment| {
                let partition = assignment.partition().clone();
                let flow = PartitionFlow {
                    broker: Arc::clone(&self.broker),
                    group: group.clone(),
                    partition: partition.clone(),
                    cursor: assignment.offset(),
                    handler: Arc::clone(&self.handler),
                    policy: self.policy.clone(),
                    router: Arc::clone(&self.router),
                    config: self.config.clone(),
                    token: token.child_token(),
                };
                (partition, tokio::spawn(flow.run()))
            })
            .collect();

        Ok(PipelineHandle { token, workers })
    }
}

/// Running pipeline: cancellation token plus the partition worker tasks.
/// Workers are joined under the caller's control.
pub struct PipelineHandle {
    token: CancellationToken,
    workers: Vec<(Partition, JoinHandle<Result<(), PipelineError>>)>,
}

impl PipelineHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request a stop. Workers finish the record in flight (cancellation
    /// never interrupts a running handler) and stop before the next pull.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and join every worker.
    pub async fn shutdown(self) -> Vec<(Partition, Result<(), PipelineError>)> {
        self.token.cancel();
        self.join().await
    }

    /// Join without cancelling: returns when every worker has stopped on its
    /// own (explicit halt or external cancellation).
    pub async fn join(self) -> Vec<(Partition, Result<(), PipelineError>)> {
        let mut results = Vec::with_capacity(self.workers.len());
        for (partition, handle) in self.workers {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::WorkerPanic(e.to_string())),
            };
            if let Err(e) = &result {
                error!(partition = %partition, error = %e, "partition flow halted with error");
            }
            results.push((partition, result));
        }
        results
    }
}

struct PartitionFlow<B: BrokerClient + 'static> {
    broker: Arc<B>,
    group: String,
    partition: Partition,
    cursor: i64,
    handler: Arc<dyn Handler>,
    policy: RetryPolicy,
    router: Arc<DeadLetterRouter<B>>,
    config: PipelineConfig,
    token: CancellationToken,
}

impl<B: BrokerClient + 'static> PartitionFlow<B> {
    async fn run(mut self) -> Result<(), PipelineError> {
        info!(partition = %self.partition, cursor = self.cursor, "partition flow started");
        loop {
            if self.token.is_cancelled() {
                break;
            }
            let fetched = tokio::select! {
                _ = self.token.cancelled() => break,
                fetched = self.broker.fetch(
                    &self.partition,
                    self.cursor,
                    IsolationLevel::ReadCommitted,
                ) => fetched,
            };
            match fetched {
                Ok(Some(record)) => self.process(record).await?,
                Ok(None) => self.idle().await,
                Err(e) if e.is_transient() => {
                    warn!(partition = %self.partition, error = %e, "transient fetch error");
                    self.idle().await;
                }
                Err(source) => {
                    return Err(PipelineError::Fetch {
                        partition: self.partition.to_string(),
                        source,
                    });
                }
            }
        }
        info!(partition = %self.partition, "partition flow stopped");
        Ok(())
    }

    /// Drive one record to a terminal state. Returns an error only for the
    /// explicit-halt conditions: dead-letter publish failure or offset
    /// commit failure.
    async fn process(&mut self, record: Record) -> Result<(), PipelineError> {
        let mut message = ConsumedMessage::new(record, self.group.clone());
        loop {
            message.attempt_count += 1;
            match self.handler.handle(&message.record).await {
                Ok(()) => {
                    // Commit strictly after handling; never before.
                    self.commit(message.record.offset).await?;
                    metrics::counter!(RECORDS_PROCESSED).increment(1);
                    debug!(
                        partition = %self.partition,
                        offset = message.record.offset,
                        attempts = message.attempt_count,
                        "record processed"
                    );
                    self.cursor = message.record.offset + 1;
                    return Ok(());
                }
                Err(handler_error) => {
                    match self.policy.decide(message.attempt_count, &handler_error) {
                        RetryDecision::Retry { after } => {
                            warn!(
                                partition = %self.partition,
                                offset = message.record.offset,
                                attempt = message.attempt_count,
                                backoff_ms = after.as_millis() as u64,
                                error = %handler_error,
                                "handler failed, retrying after backoff"
                            );
                            metrics::counter!(RECORDS_RETRIED).increment(1);
                            tokio::select! {
                                _ = tokio::time::sleep(after) => {}
                                _ = self.token.cancelled() => {
                                    // Stop without committing: the record is
                                    // redelivered on restart.
                                    return Ok(());
                                }
                            }
                        }
                        RetryDecision::GiveUp { reason } => {
                            warn!(
                                partition = %self.partition,
                                offset = message.record.offset,
                                attempts = message.attempt_count,
                                reason = %reason,
                                "handler gave up, routing record to dead letter topic"
                            );
                            self.router
                                .route(&message.record, &reason, message.attempt_count)
                                .await?;
                            // The poison record must not block the partition:
                            // commit its offset and move on.
                            self.commit(message.record.offset).await?;
                            metrics::counter!(RECORDS_DEAD_LETTERED).increment(1);
                            self.cursor = message.record.offset + 1;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval()) => {}
            _ = self.token.cancelled() => {}
        }
    }

    async fn commit(&self, offset: i64) -> Result<(), PipelineError> {
        self.broker
            .commit_offset(&self.group, &self.partition, offset + 1)
            .await
            .map_err(|source| PipelineError::OffsetCommit {
                partition: self.partition.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProducerConfig;
    use crate::producer::ProducerClient;
    use common_broker::{InMemoryBroker, TopicSpec};
    use std::time::Duration;

    struct NoopHandler;

    #[async_trait]
    impl Handler for NoopHandler {
        async fn handle(&self, _record: &Record) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_workers() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic(&TopicSpec::new("events")).await.unwrap();

        let router = DeadLetterRouter::new(
            ProducerClient::new(Arc::clone(&broker), ProducerConfig::default()),
            3,
            Duration::from_millis(5),
        );
        let mut config = PipelineConfig::for_topic("group", "events");
        config.poll_interval_ms = 5;

        let pipeline = ConsumptionPipeline::new(
            Arc::clone(&broker),
            Arc::new(NoopHandler),
            RetryPolicy::default(),
            router,
            config,
        );
        let handle = pipeline.start().await.unwrap();

        let results = handle.shutdown().await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
