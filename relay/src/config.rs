use std::time::Duration;

use envconfig::Envconfig;

use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct ProducerConfig {
    // Bound on transparent retries of a single append against transient
    // broker errors; exhaustion surfaces as SendFailed.
    #[envconfig(default = "5")]
    pub max_send_attempts: u32,

    #[envconfig(default = "100")]
    pub send_retry_backoff_ms: u64,

    // A commit that does not confirm within this window is aborted, never
    // assumed successful.
    #[envconfig(default = "10000")]
    pub transaction_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: 5,
            send_retry_backoff_ms: 100,
            transaction_timeout_ms: 10000,
        }
    }
}

impl ProducerConfig {
    pub fn send_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.send_retry_backoff_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct PipelineConfig {
    pub consumer_group: String,
    pub consumer_topic: String,

    #[envconfig(default = "50")]
    pub poll_interval_ms: u64,

    #[envconfig(default = "1000")]
    pub retry_initial_backoff_ms: u64,

    // 1 means fixed backoff; >1 grows the interval per attempt.
    #[envconfig(default = "1")]
    pub retry_backoff_coefficient: u32,

    #[envconfig(default = "3")]
    pub retry_max_attempts: u32,

    #[envconfig(default = "3")]
    pub dead_letter_publish_attempts: u32,

    #[envconfig(default = "200")]
    pub dead_letter_backoff_ms: u64,
}

impl PipelineConfig {
    /// Group and topic are application specific, so there are no good derive
    /// defaults; this lets services seed them before init'ing their config
    /// struct from the environment.
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("CONSUMER_GROUP").is_err() {
            std::env::set_var("CONSUMER_GROUP", consumer_group);
        }
        if std::env::var("CONSUMER_TOPIC").is_err() {
            std::env::set_var("CONSUMER_TOPIC", consumer_topic);
        }
    }

    /// All-defaults config for the given group and topic.
    pub fn for_topic(consumer_group: impl Into<String>, consumer_topic: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            consumer_topic: consumer_topic.into(),
            poll_interval_ms: 50,
            retry_initial_backoff_ms: 1000,
            retry_backoff_coefficient: 1,
            retry_max_attempts: 3,
            dead_letter_publish_attempts: 3,
            dead_letter_backoff_ms: 200,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn dead_letter_backoff(&self) -> Duration {
        Duration::from_millis(self.dead_letter_backoff_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
        )
        .backoff_coefficient(self.retry_backoff_coefficient)
        .provide()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_topic_matches_documented_defaults() {
        let config = PipelineConfig::for_topic("group", "topic");
        assert_eq!(config.retry_max_attempts, 3);
        assert_eq!(config.retry_initial_backoff_ms, 1000);
        assert_eq!(config.retry_backoff_coefficient, 1);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_interval(1), Duration::from_secs(1));
        assert_eq!(policy.retry_interval(3), Duration::from_secs(1));
    }
}
