//! Process-wide table of consumer jobs keyed by (cluster, topic).
//!
//! At most one job per key is active (`Starting`, `Running` or `Stopping`).
//! Each key has its own async lock, so control calls on one key never wait
//! on another key. A terminal job stays in the table, answering status
//! queries, until the next `start` for its key replaces it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, Result};
use crate::job::{ConsumerJob, JobHandle, JobState, PartitionCursor};
use crate::policy::ConsumptionPolicy;
use crate::store::RecordStore;

/// Identity of a consumer job and of its cached records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub cluster_id: String,
    pub topic: String,
}

impl JobKey {
    pub fn new(cluster_id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            topic: topic.into(),
        }
    }

    fn not_found(&self) -> ConsumerError {
        ConsumerError::NotFound {
            cluster_id: self.cluster_id.clone(),
            topic: self.topic.clone(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster_id, self.topic)
    }
}

/// Status answer for a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub is_running: bool,
    pub record_count: i64,
}

/// Diagnostic view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub policy: ConsumptionPolicy,
    pub state: JobState,
    pub record_count: i64,
    pub partitions: Vec<PartitionCursor>,
}

struct ActiveJob {
    policy: ConsumptionPolicy,
    handle: Arc<JobHandle>,
}

type Slot = Arc<tokio::sync::Mutex<Option<ActiveJob>>>;

/// Consumer job registry.
pub struct ConsumerRegistry {
    slots: Mutex<HashMap<JobKey, Slot>>,
    store: Arc<RecordStore>,
    settings: ConsumerConfig,
}

impl ConsumerRegistry {
    #[must_use]
    pub fn new(store: Arc<RecordStore>, settings: ConsumerConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            store,
            settings,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    fn slot(&self, key: &JobKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn existing_slot(&self, key: &JobKey) -> Option<Slot> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).cloned()
    }

    async fn handle(&self, key: &JobKey) -> Option<Arc<JobHandle>> {
        let slot = self.existing_slot(key)?;
        let guard = slot.lock().await;
        guard.as_ref().map(|job| Arc::clone(&job.handle))
    }

    /// Start a job for `key`.
    ///
    /// Fails with `Validation` for an invalid policy and with
    /// `AlreadyRunning` while a previous job for the key is active. Otherwise
    /// clears the cached records of the topic and spawns the run.
    pub async fn start(
        &self,
        key: JobKey,
        policy: ConsumptionPolicy,
        adapter: Arc<dyn BrokerAdapter>,
    ) -> Result<()> {
        policy.validate()?;

        let slot = self.slot(&key);
        let mut current = slot.lock().await;
        if let Some(job) = current.as_ref() {
            if !job.handle.state().is_terminal() {
                return Err(ConsumerError::AlreadyRunning {
                    cluster_id: key.cluster_id.clone(),
                    topic: key.topic.clone(),
                }
                .into());
            }
        }

        let removed = self.on_store(&key, |store, key| store.clear(key)).await?;

        let handle = Arc::new(JobHandle::new());
        let job = ConsumerJob::new(
            key.clone(),
            policy,
            adapter,
            Arc::clone(&self.store),
            self.settings.clone(),
            Arc::clone(&handle),
        );
        let task = tokio::task::spawn_blocking(move || job.run());
        let watched = Arc::clone(&handle);
        let task_key = key.clone();
        tokio::spawn(async move {
            if let Err(err) = task.await {
                warn!(cluster_id = %task_key.cluster_id, topic = %task_key.topic, error = %err, "Consumer task aborted");
                watched.fail(format!("consumer task aborted: {err}"));
            }
        });

        info!(
            cluster_id = %key.cluster_id,
            topic = %key.topic,
            policy = %policy,
            cleared = removed,
            "Consumer started"
        );
        *current = Some(ActiveJob { policy, handle });
        Ok(())
    }

    /// Signal the job for `key` to stop and return immediately.
    ///
    /// Fails with `NotFound` when no job was ever started for the key.
    /// Stopping a finished job is a no-op.
    pub async fn stop(&self, key: &JobKey) -> Result<()> {
        let handle = self.handle(key).await.ok_or_else(|| key.not_found())?;
        if handle.state().is_terminal() {
            return Ok(());
        }
        if handle.request_stop() {
            info!(cluster_id = %key.cluster_id, topic = %key.topic, "Consumer stop requested");
        }
        Ok(())
    }

    /// Stop every active job. Returns how many were signalled.
    pub async fn stop_all(&self) -> usize {
        let slots: Vec<Slot> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.values().cloned().collect()
        };
        let mut signalled = 0;
        for slot in slots {
            let guard = slot.lock().await;
            if let Some(job) = guard.as_ref() {
                if !job.handle.state().is_terminal() && job.handle.request_stop() {
                    signalled += 1;
                }
            }
        }
        signalled
    }

    /// Delete the cached records of `key`. Returns the number of rows removed.
    ///
    /// Holds the key's slot for the whole delete, so it never interleaves
    /// with a `start`. Fails with `AlreadyRunning` while a job is active.
    pub async fn clear(&self, key: &JobKey) -> Result<usize> {
        let slot = self.slot(key);
        let current = slot.lock().await;
        if let Some(job) = current.as_ref() {
            if !job.handle.state().is_terminal() {
                return Err(ConsumerError::AlreadyRunning {
                    cluster_id: key.cluster_id.clone(),
                    topic: key.topic.clone(),
                }
                .into());
            }
        }
        let removed = self.on_store(key, |store, key| store.clear(key)).await?;
        info!(cluster_id = %key.cluster_id, topic = %key.topic, removed, "Cached records cleared");
        drop(current);
        Ok(removed)
    }

    async fn on_store<T, F>(&self, key: &JobKey, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RecordStore, &JobKey) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let key = key.clone();
        tokio::task::spawn_blocking(move || f(&store, &key)).await?
    }

    /// `{false, 0}` when no job was ever started for `key`. Otherwise the
    /// count is the store's row count for the topic.
    pub async fn status(&self, key: &JobKey) -> Result<JobProgress> {
        let Some(handle) = self.handle(key).await else {
            return Ok(JobProgress::default());
        };
        let is_running = !handle.state().is_terminal();
        let record_count = self
            .on_store(key, |store, key| store.count(key))
            .await?;
        Ok(JobProgress {
            is_running,
            record_count,
        })
    }

    pub async fn snapshot(&self, key: &JobKey) -> Result<Option<JobSnapshot>> {
        let Some(slot) = self.existing_slot(key) else {
            return Ok(None);
        };
        let (policy, handle) = {
            let guard = slot.lock().await;
            match guard.as_ref() {
                Some(job) => (job.policy, Arc::clone(&job.handle)),
                None => return Ok(None),
            }
        };
        let record_count = self
            .on_store(key, |store, key| store.count(key))
            .await?;
        Ok(Some(JobSnapshot {
            key: key.clone(),
            policy,
            state: handle.state(),
            record_count,
            partitions: handle.cursors(),
        }))
    }

    /// Wait until the job for `key` is terminal, or `timeout` elapses.
    ///
    /// Returns the state observed last; it is non-terminal only on timeout.
    pub async fn wait_until_terminal(&self, key: &JobKey, timeout: Duration) -> Result<JobState> {
        let handle = self.handle(key).await.ok_or_else(|| key.not_found())?;
        let mut rx = handle.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(JobState::is_terminal)).await {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) | Err(_) => Ok(handle.state()),
        }
    }
}
