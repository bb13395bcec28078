//! Engine: the control and query surface used by front ends.
//!
//! Every call names a cluster by id. Unknown ids fail with
//! `ConfigError::UnknownCluster` before anything else happens. Broker
//! adapters are created on first use and reused per cluster.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::{self, AdapterFactory, BrokerAdapter, TopicConfigs, TopicInfo};
use crate::config::{ClusterConfig, Config};
use crate::error::Result;
use crate::job::JobState;
use crate::policy::ConsumptionPolicy;
use crate::query::QueryFacade;
use crate::registry::{ConsumerRegistry, JobKey, JobProgress, JobSnapshot};
use crate::store::{CachedTopic, ConsumedRecord, RecordFilter, RecordStore};

/// Partition metadata with current watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDetails {
    pub id: i32,
    pub isr: usize,
    pub replicas: usize,
    pub low_watermark: i64,
    pub high_watermark: i64,
}

/// Topic metadata with per-partition watermarks and topic configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDetails {
    pub name: String,
    pub partitions: Vec<PartitionDetails>,
    /// Config entries by name; sensitive or unset values are `None`
    pub configurations: TopicConfigs,
}

impl TopicDetails {
    /// Records currently retained across partitions.
    #[must_use]
    pub fn retained_records(&self) -> i64 {
        self.partitions
            .iter()
            .map(|p| p.high_watermark - p.low_watermark)
            .sum()
    }
}

/// Consumer engine for a set of configured clusters.
pub struct Engine {
    config: Config,
    registry: ConsumerRegistry,
    query: QueryFacade,
    factory: Arc<dyn AdapterFactory>,
    adapters: Mutex<HashMap<String, Arc<dyn BrokerAdapter>>>,
}

impl Engine {
    /// Open the record store named by `config` and use the default adapter
    /// factory.
    pub fn open(config: Config) -> Result<Self> {
        let path = config.db_path();
        let store = RecordStore::open(
            &path,
            Duration::from_millis(config.storage.busy_timeout_ms),
        )?;
        info!(path = %path.display(), clusters = config.clusters.len(), "Engine opened");
        Ok(Self::with_store(config, Arc::new(store), broker::default_factory()))
    }

    #[must_use]
    pub fn with_store(
        config: Config,
        store: Arc<RecordStore>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        let registry = ConsumerRegistry::new(Arc::clone(&store), config.consumer.clone());
        Self {
            config,
            registry,
            query: QueryFacade::new(store),
            factory,
            adapters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn key(&self, cluster_id: &str, topic: &str) -> Result<JobKey> {
        self.config.cluster(cluster_id)?;
        Ok(JobKey::new(cluster_id, topic))
    }

    fn adapter(&self, cluster: &ClusterConfig) -> Result<Arc<dyn BrokerAdapter>> {
        let mut adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(adapter) = adapters.get(&cluster.id) {
            return Ok(Arc::clone(adapter));
        }
        let adapter = self.factory.connect(cluster, &self.config.consumer)?;
        debug!(cluster_id = %cluster.id, "Broker adapter created");
        adapters.insert(cluster.id.clone(), Arc::clone(&adapter));
        Ok(adapter)
    }

    async fn with_adapter<T, F>(&self, cluster_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&dyn BrokerAdapter) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cluster = self.config.cluster(cluster_id)?;
        let adapter = self.adapter(cluster)?;
        tokio::task::spawn_blocking(move || f(adapter.as_ref())).await?
    }

    /// Start consuming `topic`, replacing its cached records.
    pub async fn start_consumer(
        &self,
        cluster_id: &str,
        topic: &str,
        policy: ConsumptionPolicy,
    ) -> Result<()> {
        policy.validate()?;
        let cluster = self.config.cluster(cluster_id)?;
        let adapter = self.adapter(cluster)?;
        self.registry
            .start(JobKey::new(cluster_id, topic), policy, adapter)
            .await
    }

    pub async fn stop_consumer(&self, cluster_id: &str, topic: &str) -> Result<()> {
        let key = self.key(cluster_id, topic)?;
        self.registry.stop(&key).await
    }

    pub async fn consumer_status(&self, cluster_id: &str, topic: &str) -> Result<JobProgress> {
        let key = self.key(cluster_id, topic)?;
        self.registry.status(&key).await
    }

    pub async fn consumer_snapshot(
        &self,
        cluster_id: &str,
        topic: &str,
    ) -> Result<Option<JobSnapshot>> {
        let key = self.key(cluster_id, topic)?;
        self.registry.snapshot(&key).await
    }

    /// Wait for the consumer of `topic` to finish, up to `timeout`.
    pub async fn wait_for_consumer(
        &self,
        cluster_id: &str,
        topic: &str,
        timeout: Duration,
    ) -> Result<JobState> {
        let key = self.key(cluster_id, topic)?;
        self.registry.wait_until_terminal(&key, timeout).await
    }

    pub async fn fetch_record(
        &self,
        cluster_id: &str,
        topic: &str,
        row_index: i64,
    ) -> Result<ConsumedRecord> {
        let key = self.key(cluster_id, topic)?;
        self.query.fetch_record(&key, row_index).await
    }

    pub async fn fetch_records(
        &self,
        cluster_id: &str,
        topic: &str,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<ConsumedRecord>> {
        let key = self.key(cluster_id, topic)?;
        self.query.fetch_records(&key, offset, limit).await
    }

    pub async fn record_count(&self, cluster_id: &str, topic: &str) -> Result<i64> {
        let key = self.key(cluster_id, topic)?;
        self.query.record_count(&key).await
    }

    /// Cached records of `topic` matching `filter`, paged over the matches.
    pub async fn query_records(
        &self,
        cluster_id: &str,
        topic: &str,
        filter: RecordFilter,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<ConsumedRecord>> {
        let key = self.key(cluster_id, topic)?;
        self.query.query_records(&key, filter, offset, limit).await
    }

    pub async fn count_matching(
        &self,
        cluster_id: &str,
        topic: &str,
        filter: RecordFilter,
    ) -> Result<i64> {
        let key = self.key(cluster_id, topic)?;
        self.query.count_matching(&key, filter).await
    }

    /// Drop the cached records of an idle topic.
    pub async fn clear_records(&self, cluster_id: &str, topic: &str) -> Result<usize> {
        let key = self.key(cluster_id, topic)?;
        self.registry.clear(&key).await
    }

    /// Topics cached locally, across clusters.
    pub async fn cached_topics(&self) -> Result<Vec<CachedTopic>> {
        self.query.cached_topics().await
    }

    pub async fn list_topics(&self, cluster_id: &str) -> Result<Vec<TopicInfo>> {
        self.with_adapter(cluster_id, |adapter| Ok(adapter.list_topics()?))
            .await
    }

    pub async fn topic_info(&self, cluster_id: &str, topic: &str) -> Result<TopicDetails> {
        let topic = topic.to_string();
        self.with_adapter(cluster_id, move |adapter| {
            let info = adapter.topic(&topic)?;
            let mut partitions = Vec::with_capacity(info.partitions.len());
            for partition in info.partitions {
                let marks = adapter.watermarks(&topic, partition.id)?;
                partitions.push(PartitionDetails {
                    id: partition.id,
                    isr: partition.isr,
                    replicas: partition.replicas,
                    low_watermark: marks.low,
                    high_watermark: marks.high,
                });
            }
            let configurations = adapter.topic_configs(&topic)?;
            Ok(TopicDetails {
                name: info.name,
                partitions,
                configurations,
            })
        })
        .await
    }

    /// Signal every active consumer to stop.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.registry.stop_all().await;
        if stopped > 0 {
            info!(consumers = stopped, "Stopping consumers");
        }
        stopped
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::broker::{ScriptedBroker, ScriptedFactory, TopicScript};
    use crate::config::Authentication;
    use crate::error::ConfigError;

    fn engine(broker: ScriptedBroker) -> Engine {
        let mut config = Config::default();
        config.consumer.poll_timeout_ms = 5;
        config.clusters.push(ClusterConfig {
            id: "local".to_string(),
            name: "Local".to_string(),
            endpoint: "scripted:9092".to_string(),
            authentication: Authentication::None,
            properties: BTreeMap::new(),
        });
        let factory = ScriptedFactory::new().with_cluster("local", broker);
        Engine::with_store(
            config,
            Arc::new(RecordStore::open_in_memory().unwrap()),
            Arc::new(factory),
        )
    }

    #[tokio::test]
    async fn unknown_cluster_is_rejected_everywhere() {
        let engine = engine(ScriptedBroker::new());
        let is_unknown = |err: crate::Error| {
            matches!(err, crate::Error::Config(ConfigError::UnknownCluster(ref id)) if id == "nope")
        };
        assert!(is_unknown(
            engine
                .start_consumer("nope", "t", ConsumptionPolicy::Earliest)
                .await
                .unwrap_err()
        ));
        assert!(is_unknown(engine.consumer_status("nope", "t").await.unwrap_err()));
        assert!(is_unknown(engine.list_topics("nope").await.unwrap_err()));
        assert!(is_unknown(engine.record_count("nope", "t").await.unwrap_err()));
    }

    #[tokio::test]
    async fn topic_info_includes_watermarks() {
        let engine = engine(
            ScriptedBroker::new().with_topic(
                "orders",
                TopicScript::new()
                    .sequential(0, 100, 0, 1)
                    .sequential(1, 50, 0, 1)
                    .replication(3, 3)
                    .config("cleanup.policy", Some("delete"))
                    .config("sasl.jaas.config", None),
            ),
        );
        let topics = engine.list_topics("local").await.unwrap();
        assert_eq!(topics[0].name, "orders");
        assert_eq!(topics[0].partitions[0].replicas, 3);

        let details = engine.topic_info("local", "orders").await.unwrap();
        assert_eq!(details.partitions[1].high_watermark, 50);
        assert_eq!(details.retained_records(), 150);
        assert_eq!(
            details.configurations["cleanup.policy"].as_deref(),
            Some("delete")
        );
        assert_eq!(details.configurations["sasl.jaas.config"], None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn clear_is_refused_while_consuming() {
        let engine = engine(
            ScriptedBroker::new().with_topic("t", TopicScript::new().sequential(0, 3, 0, 1)),
        );
        engine
            .start_consumer("local", "t", ConsumptionPolicy::Latest)
            .await
            .unwrap();
        let err = engine.clear_records("local", "t").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Consumer(crate::error::ConsumerError::AlreadyRunning { .. })
        ));

        assert_eq!(engine.shutdown().await, 1);
        engine
            .wait_for_consumer("local", "t", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(engine.clear_records("local", "t").await.unwrap(), 0);
    }
}
