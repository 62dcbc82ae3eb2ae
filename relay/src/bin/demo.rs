//! End-to-end demo of the delivery layer against the in-memory broker:
//! plain, JSON and transactional produces across the bundled topics, then a
//! consumer pipeline whose handler rejects "error" payloads to show retry
//! and dead-letter diversion. A payload carrying the "fail" marker aborts
//! its transaction before commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_broker::{InMemoryBroker, IsolationLevel, PendingRecord, Record, TopicSpec};
use envconfig::Envconfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use relay::config::{PipelineConfig, ProducerConfig};
use relay::dead_letter::{dead_letter_topic, DeadLetterEnvelope, DeadLetterRouter};
use relay::pipeline::{ConsumptionPipeline, Handler};
use relay::producer::ProducerClient;
use relay::provision;
use relay::retry::HandlerError;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Serialize)]
struct UserSignup {
    id: u64,
    name: String,
    email: String,
}

/// Rejects payloads containing "error", the way a flaky downstream would.
struct MarkerHandler;

#[async_trait]
impl Handler for MarkerHandler {
    async fn handle(&self, record: &Record) -> Result<(), HandlerError> {
        let payload = record.value_utf8().unwrap_or_default();
        if payload.contains("error") {
            return Err(HandlerError::retriable("simulated processing error"));
        }
        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            payload,
            "handled record"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let _metrics = PrometheusBuilder::new().install_recorder()?;

    PipelineConfig::set_defaults("demo-group", "demo-events");
    let producer_config = ProducerConfig::init_from_env()?;
    let mut pipeline_config = PipelineConfig::init_from_env()?;
    // Short backoff so the retry/dead-letter flow is visible within seconds.
    pipeline_config.retry_initial_backoff_ms = 200;

    let broker = Arc::new(InMemoryBroker::new());
    let topic = pipeline_config.consumer_topic.clone();
    let basic_topic = "demo-basic";
    let json_topic = "demo-json";

    // The bundled topics: plain sends, JSON payloads, and the pipeline's
    // topic with its dead-letter companion.
    provision::ensure_all(
        broker.as_ref(),
        &[
            TopicSpec::new(basic_topic),
            TopicSpec::new(json_topic),
            TopicSpec::new(&topic),
            TopicSpec::new(dead_letter_topic(&topic)),
        ],
    )
    .await?;

    let producer = ProducerClient::new(Arc::clone(&broker), producer_config.clone());

    // Plain fire-and-forget send.
    let offset = producer
        .send(PendingRecord::new(basic_topic, "hello log").with_key("greeting"))
        .await?;
    info!(partition = offset.partition_number(), offset = offset.offset(), "plain send acknowledged");

    // Structured JSON payload.
    let signup = UserSignup {
        id: 1,
        name: "Ada".to_string(),
        email: "ada@example.com".to_string(),
    };
    producer.send_json(json_topic, Some("user-1"), &signup).await?;

    // Transactional batch: all three become visible atomically.
    producer
        .send_all_transactional(vec![
            PendingRecord::new(&topic, "txn record 1"),
            PendingRecord::new(&topic, "txn record 2"),
            PendingRecord::new(&topic, "txn record 3"),
        ])
        .await?;

    // A payload carrying the "fail" marker: business logic rejects it before
    // commit, so the record never becomes visible.
    let txn = producer.begin_transaction().await?;
    let payload = "this transfer will fail downstream";
    txn.send(PendingRecord::new(&topic, payload)).await?;
    if payload.contains("fail") {
        warn!(payload, "payload carries the fail marker, aborting transaction");
        txn.abort().await?;
    } else {
        txn.commit().await?;
    }

    // A poison record: retried per policy, then dead-lettered.
    producer
        .send(PendingRecord::new(&topic, "payload with error marker"))
        .await?;

    let router = DeadLetterRouter::new(
        ProducerClient::new(Arc::clone(&broker), producer_config),
        pipeline_config.dead_letter_publish_attempts,
        pipeline_config.dead_letter_backoff(),
    );
    let pipeline = ConsumptionPipeline::new(
        Arc::clone(&broker),
        Arc::new(MarkerHandler),
        pipeline_config.retry_policy(),
        router,
        pipeline_config.clone(),
    );
    let handle = pipeline.start().await?;

    // Enough for three attempts with 200ms backoff plus the DLT publish.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for (partition, result) in handle.shutdown().await {
        if let Err(e) = result {
            warn!(partition = %partition, error = %e, "partition flow ended with error");
        }
    }

    let dead_letters = broker
        .visible_records(&dead_letter_topic(&topic), IsolationLevel::ReadCommitted)
        .await;
    for record in &dead_letters {
        let envelope: DeadLetterEnvelope = serde_json::from_slice(&record.value)?;
        info!(
            original_topic = %envelope.original_topic,
            attempts = envelope.attempt_count,
            reason = %envelope.failure_reason,
            "dead letter envelope"
        );
    }
    info!(
        visible = broker.visible_records(&topic, IsolationLevel::ReadCommitted).await.len(),
        dead_letters = dead_letters.len(),
        "demo finished"
    );

    Ok(())
}
