//! Idempotent topic provisioning. Creating a topic that already exists with
//! an identical spec is a no-op; a conflicting spec is a descriptive error,
//! never an automatic alteration.

use common_broker::{BrokerClient, BrokerError, TopicSpec};
use tracing::{debug, info};

use crate::error::ProvisionError;

pub async fn ensure<B: BrokerClient>(broker: &B, spec: &TopicSpec) -> Result<(), ProvisionError> {
    spec.validate().map_err(|reason| ProvisionError::InvalidSpec {
        name: spec.name.clone(),
        reason,
    })?;

    match broker.topic_spec(&spec.name).await? {
        Some(existing) if existing == *spec => {
            debug!(topic = %spec.name, "topic exists with identical spec, nothing to do");
            Ok(())
        }
        Some(existing) => Err(ProvisionError::SpecMismatch {
            name: spec.name.clone(),
            existing,
            requested: spec.clone(),
        }),
        None => match broker.create_topic(spec).await {
            Ok(()) => {
                info!(
                    topic = %spec.name,
                    partitions = spec.partitions,
                    replication_factor = spec.replication_factor,
                    "topic created"
                );
                Ok(())
            }
            // Lost a create race; compare against whatever won.
            Err(BrokerError::TopicExists(_)) => match broker.topic_spec(&spec.name).await? {
                Some(existing) if existing == *spec => Ok(()),
                Some(existing) => Err(ProvisionError::SpecMismatch {
                    name: spec.name.clone(),
                    existing,
                    requested: spec.clone(),
                }),
                None => Err(ProvisionError::Broker(BrokerError::TransientIo(
                    "topic vanished during create race".to_string(),
                ))),
            },
            Err(e) => Err(ProvisionError::Broker(e)),
        },
    }
}

pub async fn ensure_all<B: BrokerClient>(
    broker: &B,
    specs: &[TopicSpec],
) -> Result<(), ProvisionError> {
    for spec in specs {
        ensure(broker, spec).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_broker::InMemoryBroker;

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let broker = InMemoryBroker::new();
        let spec = TopicSpec::new("events").with_partitions(3);

        ensure(&broker, &spec).await.unwrap();
        ensure(&broker, &spec).await.unwrap();

        assert_eq!(broker.topic_spec("events").await.unwrap(), Some(spec));
    }

    #[tokio::test]
    async fn test_conflicting_spec_is_an_error_and_changes_nothing() {
        let broker = InMemoryBroker::new();
        let original = TopicSpec::new("events").with_partitions(3);
        ensure(&broker, &original).await.unwrap();

        let conflicting = TopicSpec::new("events").with_partitions(6);
        let err = ensure(&broker, &conflicting).await.unwrap_err();
        assert!(matches!(err, ProvisionError::SpecMismatch { .. }));

        // The existing topic is untouched.
        assert_eq!(broker.topic_spec("events").await.unwrap(), Some(original));
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_reaching_broker() {
        let broker = InMemoryBroker::new();
        let err = ensure(&broker, &TopicSpec::new("events").with_partitions(0))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidSpec { .. }));
        assert_eq!(broker.topic_spec("events").await.unwrap(), None);
    }
}
