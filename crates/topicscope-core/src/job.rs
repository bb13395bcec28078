//! Consumer job: one consumption run of one topic.
//!
//! # Lifecycle
//!
//! ```text
//! Starting ──offsets resolved, assigned──► Running ──cancel / all done──► Stopping ──► Stopped
//!     │                                       │
//!     └──────────── adapter / store error ────┴──────────────────────────────────────► Failed
//! ```
//!
//! The job body is synchronous and meant for a blocking thread. The only
//! suspension point is the broker poll, bounded by the poll timeout; the
//! cancel flag is checked once per batch, so a stop request is honored
//! within one poll interval.
//!
//! Shared state lives in [`JobHandle`]: the registry reads it, only the job
//! writes it. The terminal state is published after the last store write.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn};

use crate::broker::{BrokerAdapter, PartitionOffset, PollBatch, RawRecord, TopicInfo};
use crate::config::{ConsumerConfig, DecodeErrorPolicy};
use crate::decoder::{Decoder, UNDECODABLE_PAYLOAD};
use crate::error::Result;
use crate::policy::ConsumptionPolicy;
use crate::registry::JobKey;
use crate::store::{NewRecord, RecordStore};

/// State of a consumer job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum JobState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl JobState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }

    /// Failure reason, if the job failed.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Read position of one assigned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCursor {
    pub partition: i32,
    /// Next offset expected from the broker
    pub next_offset: i64,
    /// Exclusive upper bound, if the run is bounded
    pub stop_offset: Option<i64>,
    pub done: bool,
}

impl PartitionCursor {
    fn open(partition: i32, next_offset: i64) -> Self {
        Self {
            partition,
            next_offset,
            stop_offset: None,
            done: false,
        }
    }

    fn bounded(partition: i32, next_offset: i64, stop_offset: i64) -> Self {
        Self {
            partition,
            next_offset,
            stop_offset: Some(stop_offset),
            done: next_offset >= stop_offset,
        }
    }

    fn finished(partition: i32, next_offset: i64) -> Self {
        Self {
            partition,
            next_offset,
            stop_offset: None,
            done: true,
        }
    }

    /// Whether a record at `offset` belongs to this run. Marks the cursor
    /// done once the stop offset is reached.
    fn accept(&mut self, offset: i64) -> bool {
        if self.done || offset < self.next_offset {
            return false;
        }
        if self.stop_offset.is_some_and(|stop| offset >= stop) {
            self.done = true;
            return false;
        }
        self.next_offset = offset + 1;
        if self.stop_offset.is_some_and(|stop| self.next_offset >= stop) {
            self.done = true;
        }
        true
    }

    /// The broker reports the read position has reached `position` with no
    /// further records. A bounded cursor at or past its stop is done even
    /// when the offsets before the stop held no data record.
    fn reached(&mut self, position: i64) -> bool {
        if self.done || !self.stop_offset.is_some_and(|stop| position >= stop) {
            return false;
        }
        self.next_offset = self.next_offset.max(position);
        self.done = true;
        true
    }
}

/// Translate a policy into one cursor per partition of `topic`.
///
/// - `Earliest`: low watermark, unbounded.
/// - `Latest`: high watermark, unbounded.
/// - `Custom`: first offset at or after the start timestamp; a partition with
///   no such record is done immediately. With a stop timestamp, the stop
///   offset is the first offset after it, or the high watermark when no
///   record is that recent.
pub fn resolve_cursors(
    adapter: &dyn BrokerAdapter,
    topic: &TopicInfo,
    policy: &ConsumptionPolicy,
) -> Result<Vec<PartitionCursor>> {
    let ids: Vec<i32> = topic.partitions.iter().map(|p| p.id).collect();
    let mut cursors = Vec::with_capacity(ids.len());

    match *policy {
        ConsumptionPolicy::Earliest => {
            for &id in &ids {
                let marks = adapter.watermarks(&topic.name, id)?;
                cursors.push(PartitionCursor::open(id, marks.low));
            }
        }
        ConsumptionPolicy::Latest => {
            for &id in &ids {
                let marks = adapter.watermarks(&topic.name, id)?;
                cursors.push(PartitionCursor::open(id, marks.high));
            }
        }
        ConsumptionPolicy::Custom {
            start_timestamp_ms,
            stop_timestamp_ms,
        } => {
            let starts = adapter.offsets_for_timestamp(&topic.name, &ids, start_timestamp_ms)?;
            let stops = match stop_timestamp_ms {
                // Inclusive bound: stop before the first record newer than `stop`.
                Some(stop) => Some(adapter.offsets_for_timestamp(
                    &topic.name,
                    &ids,
                    stop.saturating_add(1),
                )?),
                None => None,
            };
            for &id in &ids {
                let Some(start) = starts.get(&id).copied().flatten() else {
                    let marks = adapter.watermarks(&topic.name, id)?;
                    cursors.push(PartitionCursor::finished(id, marks.high));
                    continue;
                };
                let cursor = match &stops {
                    None => PartitionCursor::open(id, start),
                    Some(stops) => {
                        let stop = match stops.get(&id).copied().flatten() {
                            Some(stop) => stop,
                            None => adapter.watermarks(&topic.name, id)?.high,
                        };
                        PartitionCursor::bounded(id, start, stop)
                    }
                };
                cursors.push(cursor);
            }
        }
    }

    Ok(cursors)
}

/// State shared between a running job and its observers.
#[derive(Debug)]
pub struct JobHandle {
    state: watch::Sender<JobState>,
    cancel: AtomicBool,
    records: AtomicI64,
    cursors: Mutex<Vec<PartitionCursor>>,
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl JobHandle {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(JobState::Starting);
        Self {
            state,
            cancel: AtomicBool::new(false),
            records: AtomicI64::new(0),
            cursors: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Ask the job to stop. Returns `false` if a stop was already requested.
    pub fn request_stop(&self) -> bool {
        !self.cancel.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Records appended to the store by this run.
    #[must_use]
    pub fn record_count(&self) -> i64 {
        self.records.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cursors(&self) -> Vec<PartitionCursor> {
        self.cursors
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn set_state(&self, state: JobState) {
        self.state.send_replace(state);
    }

    /// Mark a job whose task died without reaching a terminal state.
    pub(crate) fn fail(&self, reason: String) {
        if !self.state().is_terminal() {
            self.set_state(JobState::Failed(reason));
        }
    }

    fn publish_cursors(&self, cursors: &BTreeMap<i32, PartitionCursor>) {
        if let Ok(mut published) = self.cursors.lock() {
            published.clear();
            published.extend(cursors.values().copied());
        }
    }
}

/// One consumption run.
pub struct ConsumerJob {
    key: JobKey,
    policy: ConsumptionPolicy,
    adapter: Arc<dyn BrokerAdapter>,
    store: Arc<RecordStore>,
    decoder: Box<dyn Decoder>,
    settings: ConsumerConfig,
    handle: Arc<JobHandle>,
}

impl ConsumerJob {
    #[must_use]
    pub fn new(
        key: JobKey,
        policy: ConsumptionPolicy,
        adapter: Arc<dyn BrokerAdapter>,
        store: Arc<RecordStore>,
        settings: ConsumerConfig,
        handle: Arc<JobHandle>,
    ) -> Self {
        let decoder = settings.decoder.build();
        Self {
            key,
            policy,
            adapter,
            store,
            decoder,
            settings,
            handle,
        }
    }

    /// Replace the decoder picked from configuration.
    #[must_use]
    pub fn with_decoder(mut self, decoder: Box<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Run to completion on the current thread.
    pub fn run(self) {
        let span = info_span!(
            "consumer_job",
            cluster_id = %self.key.cluster_id,
            topic = %self.key.topic,
            policy = %self.policy,
        );
        let _guard = span.enter();

        info!(decoder = self.decoder.name(), "Consumer job starting");
        match self.execute() {
            Ok(()) => {
                info!(records = self.handle.record_count(), "Consumer job stopped");
                self.handle.set_state(JobState::Stopped);
            }
            Err(err) => {
                warn!(
                    records = self.handle.record_count(),
                    error = %err,
                    "Consumer job failed"
                );
                self.handle.set_state(JobState::Failed(err.to_string()));
            }
        }
    }

    fn execute(&self) -> Result<()> {
        let topic = self.adapter.topic(&self.key.topic)?;
        let resolved = resolve_cursors(self.adapter.as_ref(), &topic, &self.policy)?;
        let mut cursors: BTreeMap<i32, PartitionCursor> =
            resolved.into_iter().map(|c| (c.partition, c)).collect();
        self.handle.publish_cursors(&cursors);

        let assignment: Vec<PartitionOffset> = cursors
            .values()
            .filter(|c| !c.done)
            .map(|c| PartitionOffset {
                partition: c.partition,
                offset: c.next_offset,
            })
            .collect();
        info!(
            partitions = cursors.len(),
            assigned = assignment.len(),
            "Partition offsets resolved"
        );

        if self.handle.stop_requested() {
            self.handle.set_state(JobState::Stopping);
            return Ok(());
        }
        if assignment.is_empty() {
            self.handle.set_state(JobState::Running);
            self.handle.set_state(JobState::Stopping);
            return Ok(());
        }

        let mut consumer = self.adapter.consumer(&self.key.topic)?;
        consumer.assign(&assignment)?;
        self.handle.set_state(JobState::Running);

        let timeout = self.settings.poll_timeout();
        loop {
            if self.handle.stop_requested() {
                info!("Stop requested");
                break;
            }

            let batch = consumer.poll(self.settings.max_batch_records, timeout)?;
            if !batch.is_empty() {
                let records = self.apply_batch(&mut cursors, batch);
                if !records.is_empty() {
                    self.store.append_batch(&self.key, &records)?;
                    let appended = i64::try_from(records.len()).unwrap_or(i64::MAX);
                    self.handle.records.fetch_add(appended, Ordering::SeqCst);
                    debug!(records = records.len(), "Batch appended");
                }
                self.handle.publish_cursors(&cursors);
            }

            if cursors.values().all(|c| c.done) {
                info!("All partitions done");
                break;
            }
        }

        self.handle.set_state(JobState::Stopping);
        if let Err(err) = consumer.unassign() {
            warn!(error = %err, "Unassign failed");
        }
        Ok(())
    }

    fn apply_batch(
        &self,
        cursors: &mut BTreeMap<i32, PartitionCursor>,
        batch: PollBatch,
    ) -> Vec<NewRecord> {
        let mut records = Vec::with_capacity(batch.records.len());
        for raw in batch.records {
            let Some(cursor) = cursors.get_mut(&raw.partition) else {
                continue;
            };
            if !cursor.accept(raw.offset) {
                continue;
            }
            if let Some(record) = self.decode(raw) {
                records.push(record);
            }
        }
        for end in batch.partition_ends {
            if let Some(cursor) = cursors.get_mut(&end.partition) {
                if cursor.reached(end.offset) {
                    debug!(partition = end.partition, offset = end.offset, "Partition reached stop offset");
                }
            }
        }
        for partition in batch.closed_partitions {
            if let Some(cursor) = cursors.get_mut(&partition) {
                if !cursor.done {
                    debug!(partition, "Partition closed");
                    cursor.done = true;
                }
            }
        }
        records
    }

    fn decode(&self, raw: RawRecord) -> Option<NewRecord> {
        match self.decoder.decode(&raw) {
            Ok(decoded) => Some(NewRecord {
                partition: raw.partition,
                offset: raw.offset,
                timestamp_ms: raw.timestamp_ms,
                key: decoded.key,
                payload: decoded.payload,
                decode_error: None,
            }),
            Err(err) => match self.settings.on_decode_error {
                DecodeErrorPolicy::Skip => {
                    debug!(partition = raw.partition, offset = raw.offset, error = %err, "Skipping undecodable record");
                    None
                }
                DecodeErrorPolicy::Placeholder => Some(NewRecord {
                    partition: raw.partition,
                    offset: raw.offset,
                    timestamp_ms: raw.timestamp_ms,
                    key: raw
                        .key
                        .as_deref()
                        .map(|k| String::from_utf8_lossy(k).into_owned()),
                    payload: Some(UNDECODABLE_PAYLOAD.to_string()),
                    decode_error: Some(err.to_string()),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{ScriptedBroker, TopicScript};
    use crate::decoder::DecoderKind;
    use crate::error::BrokerError;

    fn settings() -> ConsumerConfig {
        ConsumerConfig {
            poll_timeout_ms: 5,
            max_batch_records: 25,
            ..ConsumerConfig::default()
        }
    }

    fn run_job(
        broker: &ScriptedBroker,
        topic: &str,
        policy: ConsumptionPolicy,
        settings: ConsumerConfig,
    ) -> (Arc<JobHandle>, Arc<RecordStore>) {
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let handle = Arc::new(JobHandle::new());
        let job = ConsumerJob::new(
            JobKey::new("local", topic),
            policy,
            Arc::new(broker.clone()),
            Arc::clone(&store),
            settings,
            Arc::clone(&handle),
        );
        job.run();
        (handle, store)
    }

    #[test]
    fn cursor_accept_respects_bounds() {
        let mut cursor = PartitionCursor::bounded(0, 5, 8);
        assert!(!cursor.accept(4));
        assert!(cursor.accept(5));
        assert!(cursor.accept(7));
        assert!(cursor.done);
        assert!(!cursor.accept(8));

        let mut open = PartitionCursor::open(1, 0);
        assert!(open.accept(0));
        assert!(!open.accept(0));
        assert!(open.accept(3));
        assert_eq!(open.next_offset, 4);
        assert!(!open.done);

        let mut past_stop = PartitionCursor::bounded(2, 0, 3);
        assert!(!past_stop.accept(3));
        assert!(past_stop.done);
    }

    #[test]
    fn cursor_reached_only_finishes_bounded_runs() {
        let mut bounded = PartitionCursor::bounded(0, 2, 6);
        assert!(!bounded.reached(5));
        assert!(!bounded.done);
        assert!(bounded.reached(6));
        assert!(bounded.done);
        assert_eq!(bounded.next_offset, 6);
        assert!(!bounded.reached(7));

        let mut open = PartitionCursor::open(1, 0);
        assert!(!open.reached(100));
        assert!(!open.done);
    }

    #[test]
    fn bounded_run_finishes_across_trailing_offset_gap() {
        // Offsets 10 and 11 hold no data record; the stop lookup misses and
        // falls back to the high watermark.
        let broker = ScriptedBroker::new().with_topic(
            "t",
            TopicScript::new().sequential(0, 10, 0, 1).high_watermark(0, 12),
        );
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 0,
            stop_timestamp_ms: Some(1_000),
        };
        let (handle, store) = run_job(&broker, "t", policy, settings());
        assert_eq!(handle.state(), JobState::Stopped);
        assert_eq!(store.count(&JobKey::new("local", "t")).unwrap(), 10);
        let cursor = handle.cursors()[0];
        assert!(cursor.done);
        assert_eq!(cursor.stop_offset, Some(12));
        assert_eq!(cursor.next_offset, 12);
    }

    #[test]
    fn resolve_earliest_and_latest() {
        let broker = ScriptedBroker::new().with_topic(
            "t",
            TopicScript::new()
                .partition(
                    0,
                    (10..20)
                        .map(|offset| RawRecord {
                            partition: 0,
                            offset,
                            timestamp_ms: Some(offset),
                            key: None,
                            payload: None,
                        })
                        .collect(),
                )
                .sequential(1, 0, 0, 1),
        );
        let topic = broker.topic("t").unwrap();

        let earliest = resolve_cursors(&broker, &topic, &ConsumptionPolicy::Earliest).unwrap();
        assert_eq!(earliest[0].next_offset, 10);
        assert_eq!(earliest[1].next_offset, 0);
        assert!(earliest.iter().all(|c| !c.done && c.stop_offset.is_none()));

        let latest = resolve_cursors(&broker, &topic, &ConsumptionPolicy::Latest).unwrap();
        assert_eq!(latest[0].next_offset, 20);
        assert_eq!(latest[1].next_offset, 0);
    }

    #[test]
    fn resolve_custom_window() {
        // Partition 0: ts 1000..1099, partition 1: ts 5000..5049
        let broker = ScriptedBroker::new().with_topic(
            "t",
            TopicScript::new()
                .sequential(0, 100, 1_000, 1)
                .sequential(1, 50, 5_000, 1),
        );
        let topic = broker.topic("t").unwrap();
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 1_010,
            stop_timestamp_ms: Some(1_019),
        };
        let cursors = resolve_cursors(&broker, &topic, &policy).unwrap();
        assert_eq!(cursors[0].next_offset, 10);
        assert_eq!(cursors[0].stop_offset, Some(20));
        assert!(!cursors[0].done);
        // Everything on partition 1 is after the window: start 0, stop 0.
        assert!(cursors[1].done);

        let open = ConsumptionPolicy::Custom {
            start_timestamp_ms: 6_000,
            stop_timestamp_ms: None,
        };
        let cursors = resolve_cursors(&broker, &topic, &open).unwrap();
        assert!(cursors.iter().all(|c| c.done));
        assert_eq!(cursors[0].next_offset, 100);
    }

    #[test]
    fn stop_past_end_consumes_to_high_watermark() {
        let broker =
            ScriptedBroker::new().with_topic("t", TopicScript::new().sequential(0, 10, 0, 1));
        let topic = broker.topic("t").unwrap();
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 5,
            stop_timestamp_ms: Some(1_000),
        };
        let cursors = resolve_cursors(&broker, &topic, &policy).unwrap();
        assert_eq!(cursors[0].next_offset, 5);
        assert_eq!(cursors[0].stop_offset, Some(10));
    }

    #[test]
    fn earliest_on_closed_topic_stops_with_everything() {
        let broker = ScriptedBroker::new().with_topic(
            "orders",
            TopicScript::new()
                .sequential(0, 40, 0, 1)
                .sequential(1, 20, 0, 1)
                .closed(),
        );
        let (handle, store) = run_job(&broker, "orders", ConsumptionPolicy::Earliest, settings());
        assert_eq!(handle.state(), JobState::Stopped);
        assert_eq!(handle.record_count(), 60);
        assert_eq!(store.count(&JobKey::new("local", "orders")).unwrap(), 60);
        assert!(handle.cursors().iter().all(|c| c.done));
        assert_eq!(broker.unassign_calls(), 1);
    }

    #[test]
    fn bounded_window_stops_on_open_topic() {
        let broker =
            ScriptedBroker::new().with_topic("t", TopicScript::new().sequential(0, 100, 0, 1));
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 10,
            stop_timestamp_ms: Some(19),
        };
        let (handle, store) = run_job(&broker, "t", policy, settings());
        assert_eq!(handle.state(), JobState::Stopped);
        let page = store.page(&JobKey::new("local", "t"), 0, 100).unwrap();
        let offsets: Vec<_> = page.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn nothing_to_assign_stops_without_consumer() {
        let broker =
            ScriptedBroker::new().with_topic("t", TopicScript::new().sequential(0, 5, 0, 1));
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 100,
            stop_timestamp_ms: None,
        };
        let (handle, _) = run_job(&broker, "t", policy, settings());
        assert_eq!(handle.state(), JobState::Stopped);
        assert_eq!(handle.record_count(), 0);
        assert!(broker.assignments().is_empty());
    }

    #[test]
    fn poll_failure_fails_job() {
        let broker = ScriptedBroker::new()
            .with_topic("t", TopicScript::new().sequential(0, 100, 0, 1))
            .records_per_poll(10);
        broker.fail_poll(3, BrokerError::Connection("broker went away".to_string()));
        let (handle, store) = run_job(&broker, "t", ConsumptionPolicy::Earliest, settings());
        let state = handle.state();
        assert!(state.failure().unwrap().contains("broker went away"));
        assert_eq!(handle.record_count(), 20);
        assert_eq!(store.count(&JobKey::new("local", "t")).unwrap(), 20);
    }

    #[test]
    fn missing_topic_fails_job() {
        let broker = ScriptedBroker::new();
        let (handle, _) = run_job(&broker, "ghost", ConsumptionPolicy::Latest, settings());
        assert!(handle.state().failure().unwrap().contains("ghost"));
    }

    #[test]
    fn stop_request_before_start_stops_cleanly() {
        let broker =
            ScriptedBroker::new().with_topic("t", TopicScript::new().sequential(0, 5, 0, 1));
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let handle = Arc::new(JobHandle::new());
        assert!(handle.request_stop());
        assert!(!handle.request_stop());
        ConsumerJob::new(
            JobKey::new("local", "t"),
            ConsumptionPolicy::Earliest,
            Arc::new(broker.clone()),
            store,
            settings(),
            Arc::clone(&handle),
        )
        .run();
        assert_eq!(handle.state(), JobState::Stopped);
        assert_eq!(handle.record_count(), 0);
    }

    #[test]
    fn latest_tails_until_stopped() {
        let broker =
            ScriptedBroker::new().with_topic("t", TopicScript::new().sequential(0, 5, 0, 1));
        let store = Arc::new(RecordStore::open_in_memory().unwrap());
        let handle = Arc::new(JobHandle::new());
        let job = ConsumerJob::new(
            JobKey::new("local", "t"),
            ConsumptionPolicy::Latest,
            Arc::new(broker.clone()),
            store,
            settings(),
            Arc::clone(&handle),
        );
        let worker = std::thread::spawn(move || job.run());

        let mut rx = handle.subscribe();
        while *rx.borrow_and_update() != JobState::Running {
            std::thread::sleep(Duration::from_millis(1));
        }
        broker
            .produce(
                "t",
                RawRecord {
                    partition: 0,
                    offset: 5,
                    timestamp_ms: Some(5),
                    key: None,
                    payload: Some(b"live".to_vec()),
                },
            )
            .unwrap();
        while handle.record_count() < 1 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.state(), JobState::Running);

        handle.request_stop();
        worker.join().unwrap();
        assert_eq!(handle.state(), JobState::Stopped);
        assert_eq!(handle.record_count(), 1);
    }

    #[test]
    fn decode_failures_use_placeholder_or_skip() {
        let records = vec![
            RawRecord {
                partition: 0,
                offset: 0,
                timestamp_ms: None,
                key: Some(b"good".to_vec()),
                payload: Some(br#"{"n":1}"#.to_vec()),
            },
            RawRecord {
                partition: 0,
                offset: 1,
                timestamp_ms: None,
                key: Some(b"bad".to_vec()),
                payload: Some(b"not json".to_vec()),
            },
        ];
        let broker = ScriptedBroker::new()
            .with_topic("t", TopicScript::new().partition(0, records).closed());

        let mut json = settings();
        json.decoder = DecoderKind::Json;
        let (handle, store) = run_job(&broker, "t", ConsumptionPolicy::Earliest, json.clone());
        assert_eq!(handle.state(), JobState::Stopped);
        let page = store.page(&JobKey::new("local", "t"), 0, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].payload.as_deref(), Some(UNDECODABLE_PAYLOAD));
        assert_eq!(page[1].key.as_deref(), Some("bad"));
        assert!(page[1].decode_error.as_deref().unwrap().contains("JSON"));

        json.on_decode_error = DecodeErrorPolicy::Skip;
        let (handle, store) = run_job(&broker, "t", ConsumptionPolicy::Earliest, json);
        assert_eq!(handle.state(), JobState::Stopped);
        assert_eq!(handle.record_count(), 1);
        assert_eq!(store.count(&JobKey::new("local", "t")).unwrap(), 1);
    }

    #[test]
    fn job_state_display_and_serde() {
        assert_eq!(JobState::Running.to_string(), "running");
        let failed = JobState::Failed("boom".to_string());
        assert_eq!(failed.to_string(), "failed: boom");
        assert!(failed.is_terminal());
        assert!(!JobState::Stopping.is_terminal());
        let json = serde_json::to_string(&failed).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"boom"}"#);
    }
}
