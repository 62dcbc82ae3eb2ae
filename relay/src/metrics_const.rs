// ==== Producer metrics ====
/// Counter for appends acknowledged by the broker
pub const APPENDS_SENT: &str = "delivery_appends_total";

/// Counter for transient append failures retried with the same sequence
pub const APPEND_RETRIES: &str = "delivery_append_retries_total";

/// Counter for producer sessions fenced (by the broker or by themselves)
pub const PRODUCER_FENCED: &str = "delivery_producer_fenced_total";

/// Counter for committed transactions
pub const TRANSACTIONS_COMMITTED: &str = "delivery_transactions_committed_total";

/// Counter for aborted transactions
pub const TRANSACTIONS_ABORTED: &str = "delivery_transactions_aborted_total";

// ==== Consumption pipeline metrics ====
/// Counter for records handled successfully
pub const RECORDS_PROCESSED: &str = "delivery_records_processed_total";

/// Counter for handler attempts that failed and were scheduled for retry
pub const RECORDS_RETRIED: &str = "delivery_records_retried_total";

/// Counter for records diverted to a dead-letter topic
pub const RECORDS_DEAD_LETTERED: &str = "delivery_records_dead_lettered_total";

// ==== Dead-letter router metrics ====
/// Counter for dead-letter envelopes published
pub const DEAD_LETTERS_PUBLISHED: &str = "delivery_dead_letters_published_total";

/// Counter for dead-letter publishes that exhausted the router's retries
pub const DEAD_LETTER_PUBLISH_FAILURES: &str = "delivery_dead_letter_publish_failures_total";
