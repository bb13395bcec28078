//! In-memory broker with a deterministic poll schedule.
//!
//! Topics are declared up front with [`TopicScript`]. Each poll walks the
//! assigned partitions in ascending id order and hands out up to
//! `records_per_poll` records from each, capped by the caller's batch size.
//! A consumer that reaches the end of a partition reports it once in
//! [`PollBatch::partition_ends`], like librdkafka's partition EOF. A *closed*
//! topic also reports every exhausted partition in
//! [`PollBatch::closed_partitions`]; an open topic just returns empty polls,
//! like a live cluster with no new traffic.
//!
//! Failures can be injected for metadata calls and for a given poll number.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::{ClusterConfig, ConsumerConfig};
use crate::error::BrokerError;

use super::{
    AdapterFactory, BrokerAdapter, BrokerResult, PartitionInfo, PartitionOffset, PollBatch,
    RawRecord, RecordConsumer, TopicConfigs, TopicInfo, Watermarks,
};

/// Declarative description of one topic.
#[derive(Debug, Clone)]
pub struct TopicScript {
    partitions: BTreeMap<i32, Vec<RawRecord>>,
    high_watermarks: BTreeMap<i32, i64>,
    configs: TopicConfigs,
    closed: bool,
    replicas: usize,
    isr: usize,
}

impl Default for TopicScript {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicScript {
    #[must_use]
    pub fn new() -> Self {
        Self {
            partitions: BTreeMap::new(),
            high_watermarks: BTreeMap::new(),
            configs: TopicConfigs::new(),
            closed: false,
            replicas: 1,
            isr: 1,
        }
    }

    /// Add a partition with explicit records. Offsets must ascend.
    #[must_use]
    pub fn partition(mut self, id: i32, records: Vec<RawRecord>) -> Self {
        self.partitions.insert(id, records);
        self
    }

    /// Add a partition holding offsets `0..count`.
    ///
    /// Record `n` has key `k-<n>`, payload `p<id>-<n>` and timestamp
    /// `base_ts_ms + n * step_ms`.
    #[must_use]
    pub fn sequential(self, id: i32, count: i64, base_ts_ms: i64, step_ms: i64) -> Self {
        let records = (0..count)
            .map(|offset| RawRecord {
                partition: id,
                offset,
                timestamp_ms: Some(base_ts_ms + offset * step_ms),
                key: Some(format!("k-{offset}").into_bytes()),
                payload: Some(format!("p{id}-{offset}").into_bytes()),
            })
            .collect();
        self.partition(id, records)
    }

    /// Mark the topic as closed: exhausted partitions are reported as ended.
    #[must_use]
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    #[must_use]
    pub fn replication(mut self, replicas: usize, isr: usize) -> Self {
        self.replicas = replicas;
        self.isr = isr;
        self
    }

    /// Move the high watermark of a partition past its last record, leaving
    /// offsets that hold no data record (transaction markers, compaction).
    #[must_use]
    pub fn high_watermark(mut self, id: i32, high: i64) -> Self {
        self.high_watermarks.insert(id, high);
        self
    }

    #[must_use]
    pub fn config(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.configs.insert(name.into(), value.map(str::to_string));
        self
    }

    fn watermarks(&self, id: i32) -> Option<Watermarks> {
        let records = self.partitions.get(&id)?;
        let mut marks = match (records.first(), records.last()) {
            (Some(first), Some(last)) => Watermarks {
                low: first.offset,
                high: last.offset + 1,
            },
            _ => Watermarks { low: 0, high: 0 },
        };
        if let Some(&high) = self.high_watermarks.get(&id) {
            marks.high = marks.high.max(high);
        }
        Some(marks)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: BTreeMap<String, TopicScript>,
    metadata_failure: Option<BrokerError>,
    poll_failure: Option<(usize, BrokerError)>,
    records_per_poll: Option<usize>,
    assignments: Vec<Vec<PartitionOffset>>,
    unassign_calls: usize,
    polls: usize,
}

/// Scripted broker shared between the adapter and its consumers.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl ScriptedBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_topic(self, name: impl Into<String>, script: TopicScript) -> Self {
        self.lock().topics.insert(name.into(), script);
        self
    }

    /// Cap on records taken from a single partition per poll.
    #[must_use]
    pub fn records_per_poll(self, limit: usize) -> Self {
        self.lock().records_per_poll = Some(limit.max(1));
        self
    }

    /// Every metadata call fails with `error`.
    pub fn fail_metadata(&self, error: BrokerError) {
        self.lock().metadata_failure = Some(error);
    }

    /// The `poll_number`-th poll (1-based, counted across consumers) fails.
    pub fn fail_poll(&self, poll_number: usize, error: BrokerError) {
        self.lock().poll_failure = Some((poll_number, error));
    }

    /// Produce a record onto an existing partition.
    pub fn produce(&self, topic: &str, record: RawRecord) -> BrokerResult<()> {
        let mut state = self.lock();
        let script = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        script
            .partitions
            .get_mut(&record.partition)
            .ok_or_else(|| {
                BrokerError::Metadata(format!("{topic} has no partition {}", record.partition))
            })?
            .push(record);
        Ok(())
    }

    /// Close a topic after the fact.
    pub fn close_topic(&self, topic: &str) {
        if let Some(script) = self.lock().topics.get_mut(topic) {
            script.closed = true;
        }
    }

    /// Every assignment handed to any consumer, in call order.
    #[must_use]
    pub fn assignments(&self) -> Vec<Vec<PartitionOffset>> {
        self.lock().assignments.clone()
    }

    #[must_use]
    pub fn unassign_calls(&self) -> usize {
        self.lock().unassign_calls
    }

    #[must_use]
    pub fn poll_count(&self) -> usize {
        self.lock().polls
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent across a panicking test thread.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_metadata(state: &BrokerState) -> BrokerResult<()> {
        match &state.metadata_failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn topic_info(name: &str, script: &TopicScript) -> TopicInfo {
    TopicInfo {
        name: name.to_string(),
        partitions: script
            .partitions
            .keys()
            .map(|&id| PartitionInfo {
                id,
                isr: script.isr,
                replicas: script.replicas,
            })
            .collect(),
    }
}

impl BrokerAdapter for ScriptedBroker {
    fn list_topics(&self) -> BrokerResult<Vec<TopicInfo>> {
        let state = self.lock();
        Self::check_metadata(&state)?;
        Ok(state
            .topics
            .iter()
            .map(|(name, script)| topic_info(name, script))
            .collect())
    }

    fn topic(&self, topic: &str) -> BrokerResult<TopicInfo> {
        let state = self.lock();
        Self::check_metadata(&state)?;
        state
            .topics
            .get(topic)
            .map(|script| topic_info(topic, script))
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }

    fn topic_configs(&self, topic: &str) -> BrokerResult<TopicConfigs> {
        let state = self.lock();
        Self::check_metadata(&state)?;
        state
            .topics
            .get(topic)
            .map(|script| script.configs.clone())
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }

    fn watermarks(&self, topic: &str, partition: i32) -> BrokerResult<Watermarks> {
        let state = self.lock();
        Self::check_metadata(&state)?;
        let script = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        script.watermarks(partition).ok_or_else(|| {
            BrokerError::OffsetLookup(format!("{topic} has no partition {partition}"))
        })
    }

    fn offsets_for_timestamp(
        &self,
        topic: &str,
        partitions: &[i32],
        timestamp_ms: i64,
    ) -> BrokerResult<BTreeMap<i32, Option<i64>>> {
        let state = self.lock();
        Self::check_metadata(&state)?;
        let script = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))?;
        let mut offsets = BTreeMap::new();
        for &partition in partitions {
            let records = script.partitions.get(&partition).ok_or_else(|| {
                BrokerError::OffsetLookup(format!("{topic} has no partition {partition}"))
            })?;
            let found = records
                .iter()
                .find(|r| r.timestamp_ms.is_some_and(|ts| ts >= timestamp_ms))
                .map(|r| r.offset);
            offsets.insert(partition, found);
        }
        Ok(offsets)
    }

    fn consumer(&self, topic: &str) -> BrokerResult<Box<dyn RecordConsumer>> {
        {
            let state = self.lock();
            Self::check_metadata(&state)?;
            if !state.topics.contains_key(topic) {
                return Err(BrokerError::TopicNotFound(topic.to_string()));
            }
        }
        Ok(Box::new(ScriptedConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            positions: BTreeMap::new(),
            at_end: BTreeSet::new(),
        }))
    }
}

/// Consumer over a [`ScriptedBroker`].
#[derive(Debug)]
pub struct ScriptedConsumer {
    broker: ScriptedBroker,
    topic: String,
    positions: BTreeMap<i32, i64>,
    at_end: BTreeSet<i32>,
}

impl RecordConsumer for ScriptedConsumer {
    fn assign(&mut self, assignment: &[PartitionOffset]) -> BrokerResult<()> {
        let mut state = self.broker.lock();
        let script = state
            .topics
            .get(&self.topic)
            .ok_or_else(|| BrokerError::TopicNotFound(self.topic.clone()))?;
        for entry in assignment {
            if !script.partitions.contains_key(&entry.partition) {
                return Err(BrokerError::Assignment(format!(
                    "{} has no partition {}",
                    self.topic, entry.partition
                )));
            }
        }
        self.positions = assignment
            .iter()
            .map(|entry| (entry.partition, entry.offset))
            .collect();
        state.assignments.push(assignment.to_vec());
        Ok(())
    }

    fn poll(&mut self, max_records: usize, timeout: Duration) -> BrokerResult<PollBatch> {
        let batch = {
            let mut state = self.broker.lock();
            state.polls += 1;
            if let Some((poll_number, err)) = &state.poll_failure {
                if *poll_number == state.polls {
                    return Err(err.clone());
                }
            }
            let per_partition = state.records_per_poll.unwrap_or(usize::MAX);
            let script = state
                .topics
                .get(&self.topic)
                .ok_or_else(|| BrokerError::TopicNotFound(self.topic.clone()))?;

            let mut batch = PollBatch::default();
            for (&partition, position) in &mut self.positions {
                let records = script
                    .partitions
                    .get(&partition)
                    .map_or(&[][..], Vec::as_slice);
                let budget = per_partition.min(max_records - batch.records.len());
                let start = *position;
                let taken: Vec<&RawRecord> = records
                    .iter()
                    .filter(|r| r.offset >= start)
                    .take(budget)
                    .collect();
                if let Some(last) = taken.last() {
                    *position = last.offset + 1;
                    self.at_end.remove(&partition);
                }
                batch.records.extend(taken.into_iter().cloned());

                let exhausted = records.last().is_none_or(|last| *position > last.offset);
                if exhausted {
                    let high = script.watermarks(partition).map_or(*position, |w| w.high);
                    *position = (*position).max(high);
                    if self.at_end.insert(partition) {
                        batch.partition_ends.push(PartitionOffset {
                            partition,
                            offset: *position,
                        });
                    }
                    if script.closed {
                        batch.closed_partitions.push(partition);
                    }
                }
                if batch.records.len() >= max_records {
                    break;
                }
            }
            batch
        };

        if batch.records.is_empty() {
            std::thread::sleep(timeout);
        }
        Ok(batch)
    }

    fn unassign(&mut self) -> BrokerResult<()> {
        self.positions.clear();
        self.at_end.clear();
        self.broker.lock().unassign_calls += 1;
        Ok(())
    }
}

/// Factory that hands out scripted brokers by cluster id.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    clusters: Arc<Mutex<BTreeMap<String, ScriptedBroker>>>,
}

impl ScriptedFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_cluster(self, cluster_id: impl Into<String>, broker: ScriptedBroker) -> Self {
        self.clusters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(cluster_id.into(), broker);
        self
    }
}

impl AdapterFactory for ScriptedFactory {
    fn connect(
        &self,
        cluster: &ClusterConfig,
        _consumer: &ConsumerConfig,
    ) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        let clusters = self
            .clusters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        clusters
            .get(&cluster.id)
            .map(|broker| Arc::new(broker.clone()) as Arc<dyn BrokerAdapter>)
            .ok_or_else(|| {
                BrokerError::Connection(format!("no broker reachable at {}", cluster.endpoint))
            })
    }
}
