/// Dev-broker defaults: 3 partitions for parallel consumption, a single
/// replica because local setups run one broker. Production deployments
/// override both.
pub const DEFAULT_PARTITIONS: i32 = 3;
pub const DEFAULT_REPLICATION_FACTOR: i16 = 1;

/// Declarative description of a topic, used at provisioning time only.
/// Immutable once the topic exists: partition count changes rekey
/// key-to-partition routing and are never applied automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i16,
}

impl TopicSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: DEFAULT_PARTITIONS,
            replication_factor: DEFAULT_REPLICATION_FACTOR,
        }
    }

    pub fn with_partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_replication_factor(mut self, replication_factor: i16) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    /// Spec-level sanity check, done before anything reaches the broker.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("topic name must not be empty".to_string());
        }
        if self.partitions < 1 {
            return Err(format!(
                "topic {} must have at least 1 partition, got {}",
                self.name, self.partitions
            ));
        }
        if self.replication_factor < 1 {
            return Err(format!(
                "topic {} must have replication factor of at least 1, got {}",
                self.name, self.replication_factor
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let spec = TopicSpec::new("events");
        assert_eq!(spec.partitions, 3);
        assert_eq!(spec.replication_factor, 1);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_specs() {
        assert!(TopicSpec::new("").validate().is_err());
        assert!(TopicSpec::new("events")
            .with_partitions(0)
            .validate()
            .is_err());
        assert!(TopicSpec::new("events")
            .with_replication_factor(0)
            .validate()
            .is_err());
    }
}
