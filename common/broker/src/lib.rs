//! Broker-facing data model and client boundary for the delivery layer.
//!
//! The delivery layer is broker-agnostic: everything above it talks to the
//! [`BrokerClient`] trait, which assumes only the semantics of a partitioned
//! append-only log (per-partition offset ordering, optional transactional
//! read isolation, consumer-group offset storage). [`InMemoryBroker`] is a
//! complete single-process implementation of those semantics, used by tests
//! and by callers that don't have a real broker wired up.

pub mod client;
pub mod error;
pub mod memory;
pub mod record;
pub mod topic;
pub mod types;

pub use client::{
    AppendRequest, AppendSequencing, BrokerClient, IsolationLevel, ProducerIdentity,
};
pub use error::BrokerError;
pub use memory::InMemoryBroker;
pub use record::{Header, PendingRecord, Record};
pub use topic::TopicSpec;
pub use types::{Partition, PartitionAssignment, PartitionOffset};
