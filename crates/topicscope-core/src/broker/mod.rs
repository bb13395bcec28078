//! Broker client adapter.
//!
//! The consumer job talks to the cluster only through these traits:
//!
//! ```text
//! AdapterFactory ──connect──► BrokerAdapter ──consumer──► RecordConsumer
//!                              (metadata, watermarks,     (assign, poll,
//!                               timestamp lookups)         unassign)
//! ```
//!
//! All calls are blocking and bounded by a timeout; consumer jobs run them on
//! a dedicated blocking thread.
//!
//! Implementations:
//! - `kafka`: librdkafka via `rdkafka` (feature-gated: `kafka`)
//! - `scripted`: in-memory topics with a deterministic poll schedule

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ClusterConfig, ConsumerConfig};
use crate::error::BrokerError;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod scripted;

pub use scripted::{ScriptedBroker, ScriptedFactory, TopicScript};

/// Result alias for adapter calls
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Partition metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub id: i32,
    /// In-sync replica count
    pub isr: usize,
    /// Replica count
    pub replicas: usize,
}

/// Topic metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
}

/// Offsets bounding the retained records of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Earliest retained offset
    pub low: i64,
    /// One past the last available offset
    pub high: i64,
}

/// Partition plus the offset to start reading at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOffset {
    pub partition: i32,
    pub offset: i64,
}

/// A record as delivered by the broker, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    /// Records in broker-offset order within each partition
    pub records: Vec<RawRecord>,
    /// Partitions that reached their end and will never receive more records
    pub closed_partitions: Vec<i32>,
    /// Partitions the consumer has read to the current end of, with the
    /// position reached. The position may lie past the last delivered
    /// record when the tail holds no data records (transaction markers,
    /// compacted offsets).
    pub partition_ends: Vec<PartitionOffset>,
}

impl PollBatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.closed_partitions.is_empty()
            && self.partition_ends.is_empty()
    }
}

/// Topic configuration entries by name. `None` for entries without a value
/// (sensitive or unset).
pub type TopicConfigs = BTreeMap<String, Option<String>>;

/// Cluster-level operations.
pub trait BrokerAdapter: Send + Sync {
    /// All topics with partition metadata.
    fn list_topics(&self) -> BrokerResult<Vec<TopicInfo>>;

    /// Metadata for a single topic. Fails with `TopicNotFound` when absent.
    fn topic(&self, topic: &str) -> BrokerResult<TopicInfo>;

    /// Configuration entries of a topic.
    fn topic_configs(&self, topic: &str) -> BrokerResult<TopicConfigs>;

    /// Low and high watermarks of a partition.
    fn watermarks(&self, topic: &str, partition: i32) -> BrokerResult<Watermarks>;

    /// Earliest offset whose timestamp is at or after `timestamp_ms`, per
    /// partition. `None` means the partition has no such record.
    fn offsets_for_timestamp(
        &self,
        topic: &str,
        partitions: &[i32],
        timestamp_ms: i64,
    ) -> BrokerResult<BTreeMap<i32, Option<i64>>>;

    /// A fresh consumer handle for one job.
    fn consumer(&self, topic: &str) -> BrokerResult<Box<dyn RecordConsumer>>;
}

/// Per-job consumer handle.
pub trait RecordConsumer: Send {
    /// Replace the assignment with the given partitions and offsets.
    fn assign(&mut self, assignment: &[PartitionOffset]) -> BrokerResult<()>;

    /// Fetch up to `max_records`, waiting at most `timeout` for the first one.
    /// An empty batch is not an error.
    fn poll(&mut self, max_records: usize, timeout: Duration) -> BrokerResult<PollBatch>;

    /// Drop every assignment.
    fn unassign(&mut self) -> BrokerResult<()>;
}

/// Builds adapters from cluster configuration.
pub trait AdapterFactory: Send + Sync {
    fn connect(
        &self,
        cluster: &ClusterConfig,
        consumer: &ConsumerConfig,
    ) -> BrokerResult<Arc<dyn BrokerAdapter>>;
}

/// Factory used when this build has no broker client compiled in.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableFactory;

impl AdapterFactory for UnavailableFactory {
    fn connect(
        &self,
        cluster: &ClusterConfig,
        _consumer: &ConsumerConfig,
    ) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        Err(BrokerError::Unsupported(format!(
            "cannot connect to cluster {}: built without the `kafka` feature",
            cluster.id
        )))
    }
}

/// The adapter factory for this build.
#[must_use]
pub fn default_factory() -> Arc<dyn AdapterFactory> {
    #[cfg(feature = "kafka")]
    {
        Arc::new(kafka::KafkaAdapterFactory)
    }
    #[cfg(not(feature = "kafka"))]
    {
        Arc::new(UnavailableFactory)
    }
}
