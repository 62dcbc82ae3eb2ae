//! Retry policy for the consumption pipeline: a pure decision function from
//! (attempt count, error classification) to retry-after or give-up.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A handler failure, carrying its own classification. The policy's
/// classifier hook can override the classification (e.g. to treat specific
/// retriable messages as permanent).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("retriable handler failure: {0}")]
    Retriable(String),
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retriable(message: impl Into<String>) -> Self {
        HandlerError::Retriable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        HandlerError::Fatal(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

pub type ErrorClassifier = Arc<dyn Fn(&HandlerError) -> ErrorClass + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { after: Duration },
    GiveUp { reason: String },
}

/// A retry policy to determine what happens to a record after a failed
/// handler attempt.
#[derive(Clone)]
pub struct RetryPolicy {
    /// The backoff interval for the first retry.
    pub initial_interval: Duration,
    /// Coefficient to multiply initial_interval with for every past attempt.
    /// 1 gives fixed backoff.
    pub backoff_coefficient: u32,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<Duration>,
    /// Give up once this many attempts have been made.
    pub max_attempts: u32,
    classifier: Option<ErrorClassifier>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("initial_interval", &self.initial_interval)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("maximum_interval", &self.maximum_interval)
            .field("max_attempts", &self.max_attempts)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// Decide what happens after the `attempt`-th invocation (1-based)
    /// failed with `error`. Pure: no clock, no I/O.
    pub fn decide(&self, attempt: u32, error: &HandlerError) -> RetryDecision {
        let class = match &self.classifier {
            Some(classify) => classify(error),
            None => match error {
                HandlerError::Retriable(_) => ErrorClass::Transient,
                HandlerError::Fatal(_) => ErrorClass::Permanent,
            },
        };

        if class == ErrorClass::Permanent {
            return RetryDecision::GiveUp {
                reason: error.to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("retries exhausted after {attempt} attempts: {error}"),
            };
        }
        RetryDecision::Retry {
            after: self.retry_interval(attempt),
        }
    }

    /// Determine the backoff interval after a given attempt number.
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let candidate =
            self.initial_interval * self.backoff_coefficient.pow(attempt.saturating_sub(1));
        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub backoff_coefficient: u32,
    pub maximum_interval: Option<Duration>,
    pub classifier: Option<ErrorClassifier>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 1,
            maximum_interval: None,
            classifier: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: u32) -> RetryPolicyBuilder {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_interval(mut self, interval: Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn classifier(mut self, classifier: ErrorClassifier) -> RetryPolicyBuilder {
        self.classifier = Some(classifier);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: self.initial_interval,
            backoff_coefficient: self.backoff_coefficient,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts,
            classifier: self.classifier.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_interval() {
        let policy = RetryPolicy::build(3, Duration::from_secs(2)).provide();
        assert_eq!(policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(2), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(3), Duration::from_secs(2));
    }

    #[test]
    fn test_interval_grows_with_coefficient() {
        let policy = RetryPolicy::build(5, Duration::from_secs(2))
            .backoff_coefficient(2)
            .provide();
        assert_eq!(policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(policy.retry_interval(3), Duration::from_secs(8));
    }

    #[test]
    fn test_interval_never_exceeds_maximum() {
        let policy = RetryPolicy::build(5, Duration::from_secs(2))
            .backoff_coefficient(2)
            .maximum_interval(Duration::from_secs(4))
            .provide();
        assert_eq!(policy.retry_interval(1), Duration::from_secs(2));
        assert_eq!(policy.retry_interval(2), Duration::from_secs(4));
        assert_eq!(policy.retry_interval(4), Duration::from_secs(4));
    }

    #[test]
    fn test_decide_retries_until_attempts_exhausted() {
        let policy = RetryPolicy::build(3, Duration::from_secs(1)).provide();
        let error = HandlerError::retriable("boom");

        assert_eq!(
            policy.decide(1, &error),
            RetryDecision::Retry {
                after: Duration::from_secs(1)
            }
        );
        assert_eq!(
            policy.decide(2, &error),
            RetryDecision::Retry {
                after: Duration::from_secs(1)
            }
        );
        assert!(matches!(
            policy.decide(3, &error),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_decide_gives_up_immediately_on_fatal_error() {
        let policy = RetryPolicy::build(3, Duration::from_secs(1)).provide();
        assert!(matches!(
            policy.decide(1, &HandlerError::fatal("bad payload")),
            RetryDecision::GiveUp { .. }
        ));
    }

    #[test]
    fn test_custom_classifier_overrides_error_variant() {
        // Treat every error as permanent, retriable or not.
        let policy = RetryPolicy::build(3, Duration::from_secs(1))
            .classifier(Arc::new(|_| ErrorClass::Permanent))
            .provide();
        assert!(matches!(
            policy.decide(1, &HandlerError::retriable("boom")),
            RetryDecision::GiveUp { .. }
        ));
    }
}
