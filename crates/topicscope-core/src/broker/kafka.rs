//! Kafka adapter backed by librdkafka.
//!
//! Metadata, watermark and timestamp lookups share one long-lived
//! `BaseConsumer` per cluster; topic configuration goes through an
//! `AdminClient`. Each consumer job gets its own `BaseConsumer`
//! with a throwaway group id; offsets are assigned manually and never
//! committed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::admin::{AdminClient, AdminOptions, ResourceSpecifier};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::metadata::MetadataTopic;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, Timestamp, TopicPartitionList};
use tracing::{debug, warn};

use crate::config::{ClusterConfig, ConsumerConfig};
use crate::error::BrokerError;

use super::{
    AdapterFactory, BrokerAdapter, BrokerResult, PartitionInfo, PartitionOffset, PollBatch,
    RawRecord, RecordConsumer, TopicConfigs, TopicInfo, Watermarks,
};

/// Connects to real clusters.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaAdapterFactory;

impl AdapterFactory for KafkaAdapterFactory {
    fn connect(
        &self,
        cluster: &ClusterConfig,
        consumer: &ConsumerConfig,
    ) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        Ok(Arc::new(KafkaBroker::connect(cluster, consumer)?))
    }
}

/// Adapter for one cluster.
pub struct KafkaBroker {
    cluster_id: String,
    properties: BTreeMap<String, String>,
    timeout: Duration,
    admin: BaseConsumer,
    configs: AdminClient<DefaultClientContext>,
}

impl KafkaBroker {
    pub fn connect(cluster: &ClusterConfig, consumer: &ConsumerConfig) -> BrokerResult<Self> {
        let properties = cluster.client_properties();
        let group_id = format!("topicscope-{}-metadata", cluster.id);
        let admin: BaseConsumer = client_config(&properties, &group_id)
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let mut admin_config = ClientConfig::new();
        for (key, value) in &properties {
            admin_config.set(key, value);
        }
        let configs: AdminClient<DefaultClientContext> = admin_config
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(cluster_id = %cluster.id, endpoint = %cluster.endpoint, "Kafka client created");
        Ok(Self {
            cluster_id: cluster.id.clone(),
            properties,
            timeout: consumer.metadata_timeout(),
            admin,
            configs,
        })
    }

    fn fetch_topic(&self, topic: &str) -> BrokerResult<TopicInfo> {
        let metadata = self
            .admin
            .fetch_metadata(Some(topic), self.timeout)
            .map_err(metadata_error)?;
        metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty())
            .map(topic_info)
            .ok_or_else(|| BrokerError::TopicNotFound(topic.to_string()))
    }
}

fn client_config(properties: &BTreeMap<String, String>, group_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "true")
        .set("auto.offset.reset", "earliest");
    for (key, value) in properties {
        config.set(key, value);
    }
    config
}

fn topic_info(topic: &MetadataTopic) -> TopicInfo {
    let mut partitions: Vec<PartitionInfo> = topic
        .partitions()
        .iter()
        .map(|p| PartitionInfo {
            id: p.id(),
            isr: p.isr().len(),
            replicas: p.replicas().len(),
        })
        .collect();
    partitions.sort_by_key(|p| p.id);
    TopicInfo {
        name: topic.name().to_string(),
        partitions,
    }
}

fn is_transport_failure(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::SSL
    )
}

fn metadata_error(err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_transport_failure(code) => BrokerError::Connection(err.to_string()),
        _ => BrokerError::Metadata(err.to_string()),
    }
}

fn poll_error(err: KafkaError) -> BrokerError {
    match err.rdkafka_error_code() {
        Some(code) if is_transport_failure(code) => BrokerError::Connection(err.to_string()),
        _ => BrokerError::Poll(err.to_string()),
    }
}

impl BrokerAdapter for KafkaBroker {
    fn list_topics(&self) -> BrokerResult<Vec<TopicInfo>> {
        let metadata = self
            .admin
            .fetch_metadata(None, self.timeout)
            .map_err(metadata_error)?;
        let mut topics: Vec<TopicInfo> = metadata
            .topics()
            .iter()
            .filter(|t| t.error().is_none())
            .map(topic_info)
            .collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    fn topic(&self, topic: &str) -> BrokerResult<TopicInfo> {
        self.fetch_topic(topic)
    }

    fn topic_configs(&self, topic: &str) -> BrokerResult<TopicConfigs> {
        // Adapter calls run on blocking threads of the engine's runtime.
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BrokerError::Metadata(e.to_string()))?;
        let options = AdminOptions::new().request_timeout(Some(self.timeout));
        let resource = ResourceSpecifier::Topic(topic);
        let results = runtime
            .block_on(self.configs.describe_configs([&resource], &options))
            .map_err(metadata_error)?;

        let mut configs = TopicConfigs::new();
        for result in results {
            match result {
                Ok(resource) => {
                    for entry in resource.entries {
                        let value = if entry.is_sensitive { None } else { entry.value };
                        configs.insert(entry.name, value);
                    }
                }
                Err(RDKafkaErrorCode::UnknownTopicOrPartition) => {
                    return Err(BrokerError::TopicNotFound(topic.to_string()));
                }
                Err(code) => return Err(BrokerError::Metadata(format!("{topic}: {code}"))),
            }
        }
        Ok(configs)
    }

    fn watermarks(&self, topic: &str, partition: i32) -> BrokerResult<Watermarks> {
        let (low, high) = self
            .admin
            .fetch_watermarks(topic, partition, self.timeout)
            .map_err(|e| BrokerError::OffsetLookup(format!("{topic}/{partition}: {e}")))?;
        Ok(Watermarks { low, high })
    }

    fn offsets_for_timestamp(
        &self,
        topic: &str,
        partitions: &[i32],
        timestamp_ms: i64,
    ) -> BrokerResult<BTreeMap<i32, Option<i64>>> {
        let mut request = TopicPartitionList::with_capacity(partitions.len());
        for &partition in partitions {
            request
                .add_partition_offset(topic, partition, Offset::Offset(timestamp_ms))
                .map_err(|e| BrokerError::OffsetLookup(e.to_string()))?;
        }
        let response = self
            .admin
            .offsets_for_times(request, self.timeout)
            .map_err(|e| BrokerError::OffsetLookup(format!("{topic}: {e}")))?;

        let mut offsets: BTreeMap<i32, Option<i64>> =
            partitions.iter().map(|&p| (p, None)).collect();
        for entry in response.elements() {
            if let Err(e) = entry.error() {
                return Err(BrokerError::OffsetLookup(format!(
                    "{topic}/{}: {e}",
                    entry.partition()
                )));
            }
            // `End` means no record at or after the timestamp.
            let offset = match entry.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            };
            offsets.insert(entry.partition(), offset);
        }
        Ok(offsets)
    }

    fn consumer(&self, topic: &str) -> BrokerResult<Box<dyn RecordConsumer>> {
        let group_id = format!(
            "topicscope-{}-{}-{:08x}",
            self.cluster_id,
            topic,
            rand::random::<u32>()
        );
        let consumer: BaseConsumer = client_config(&self.properties, &group_id)
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Box::new(KafkaRecordConsumer {
            topic: topic.to_string(),
            consumer,
        }))
    }
}

/// Manually assigned consumer for one topic.
pub struct KafkaRecordConsumer {
    topic: String,
    consumer: BaseConsumer,
}

impl KafkaRecordConsumer {
    /// Fetch position of one assigned partition. May lie past the last
    /// delivered message when the log ends in control records.
    fn position(&self, partition: i32) -> Option<i64> {
        let positions = match self.consumer.position() {
            Ok(positions) => positions,
            Err(err) => {
                warn!(topic = %self.topic, partition, error = %err, "Position lookup failed");
                return None;
            }
        };
        match positions.find_partition(&self.topic, partition)?.offset() {
            Offset::Offset(offset) => Some(offset),
            _ => None,
        }
    }
}

fn raw_record(message: &BorrowedMessage<'_>) -> RawRecord {
    let timestamp_ms = match message.timestamp() {
        Timestamp::CreateTime(t) | Timestamp::LogAppendTime(t) => Some(t),
        Timestamp::NotAvailable => None,
    };
    RawRecord {
        partition: message.partition(),
        offset: message.offset(),
        timestamp_ms,
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
    }
}

impl RecordConsumer for KafkaRecordConsumer {
    fn assign(&mut self, assignment: &[PartitionOffset]) -> BrokerResult<()> {
        let mut list = TopicPartitionList::with_capacity(assignment.len());
        for entry in assignment {
            list.add_partition_offset(&self.topic, entry.partition, Offset::Offset(entry.offset))
                .map_err(|e| BrokerError::Assignment(e.to_string()))?;
        }
        self.consumer
            .assign(&list)
            .map_err(|e| BrokerError::Assignment(e.to_string()))
    }

    fn poll(&mut self, max_records: usize, timeout: Duration) -> BrokerResult<PollBatch> {
        let mut batch = PollBatch::default();
        let mut wait = timeout;
        while batch.records.len() < max_records {
            match self.consumer.poll(wait) {
                None => break,
                Some(Ok(message)) => batch.records.push(raw_record(&message)),
                Some(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(topic = %self.topic, partition, "Reached partition end");
                    if let Some(offset) = self.position(partition) {
                        batch.partition_ends.push(PartitionOffset { partition, offset });
                    }
                }
                Some(Err(err)) => {
                    warn!(topic = %self.topic, error = %err, "Poll failed");
                    return Err(poll_error(err));
                }
            }
            // Drain what is already buffered without waiting again.
            wait = Duration::ZERO;
        }
        Ok(batch)
    }

    fn unassign(&mut self) -> BrokerResult<()> {
        self.consumer
            .unassign()
            .map_err(|e| BrokerError::Assignment(e.to_string()))
    }
}
