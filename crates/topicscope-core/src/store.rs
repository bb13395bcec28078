//! Local record store.
//!
//! Consumed records live in a single SQLite table shared by every
//! (cluster, topic) pair. Each pair has its own dense insertion sequence that
//! starts at 0 and restarts at 0 after [`RecordStore::clear`], so the sequence
//! of a row is also its row index and paging is an index range scan.
//!
//! One connection behind a mutex serves the single writer (the consumer job)
//! and every reader. Batches are appended in one transaction, so a reader
//! sees either none or all of a batch.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::error::{Result, StorageError};
use crate::registry::JobKey;

/// DDL for the records table.
pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
    cluster_id      TEXT NOT NULL,
    topic           TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    partition_id    INTEGER NOT NULL,
    record_offset   INTEGER NOT NULL,
    timestamp_ms    INTEGER,
    record_key      TEXT,
    payload         TEXT,
    decode_error    TEXT,
    PRIMARY KEY (cluster_id, topic, seq)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_records_partition_offset
    ON records (cluster_id, topic, partition_id, record_offset);
";

/// A record ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<String>,
    pub payload: Option<String>,
    /// Set when the record could not be decoded; `payload` then holds a
    /// placeholder.
    pub decode_error: Option<String>,
}

/// A stored record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<String>,
    pub timestamp_ms: Option<i64>,
    /// Position in append order, starting at 0
    pub insertion_seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
}

/// Conditions for a filtered read. Every set field must match; an empty
/// filter matches every row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    pub partition: Option<i32>,
    /// Substring of the decoded key
    pub key_contains: Option<String>,
    /// Substring of the decoded payload
    pub payload_contains: Option<String>,
    pub from_timestamp_ms: Option<i64>,
    /// Inclusive
    pub to_timestamp_ms: Option<i64>,
}

impl RecordFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// WHERE clause and its positional parameters, scoped to `key`.
    fn where_clause(&self, key: &JobKey) -> (String, Vec<Value>) {
        let mut clause = String::from("cluster_id = ? AND topic = ?");
        let mut params = vec![
            Value::Text(key.cluster_id.clone()),
            Value::Text(key.topic.clone()),
        ];
        if let Some(partition) = self.partition {
            clause.push_str(" AND partition_id = ?");
            params.push(Value::Integer(i64::from(partition)));
        }
        if let Some(needle) = &self.key_contains {
            clause.push_str(" AND instr(record_key, ?) > 0");
            params.push(Value::Text(needle.clone()));
        }
        if let Some(needle) = &self.payload_contains {
            clause.push_str(" AND instr(payload, ?) > 0");
            params.push(Value::Text(needle.clone()));
        }
        if let Some(from) = self.from_timestamp_ms {
            clause.push_str(" AND timestamp_ms >= ?");
            params.push(Value::Integer(from));
        }
        if let Some(to) = self.to_timestamp_ms {
            clause.push_str(" AND timestamp_ms <= ?");
            params.push(Value::Integer(to));
        }
        (clause, params)
    }
}

/// Row count of one cached topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedTopic {
    pub cluster_id: String,
    pub topic: String,
    pub records: i64,
}

/// SQLite-backed record store.
pub struct RecordStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Open or create a store file. Parent directories are created.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let _span = info_span!("record_store_open", path = %path.display()).entered();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Backing file, `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::Database("record store lock poisoned".to_string()).into())
    }

    /// Delete every row of a topic. Returns the number of rows removed.
    pub fn clear(&self, key: &JobKey) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE cluster_id = ?1 AND topic = ?2",
            rusqlite::params![key.cluster_id, key.topic],
        )?;
        debug!(cluster_id = %key.cluster_id, topic = %key.topic, removed, "Cleared records");
        Ok(removed)
    }

    /// Append one record. Returns its insertion sequence.
    pub fn append(&self, key: &JobKey, record: &NewRecord) -> Result<i64> {
        self.append_batch(key, std::slice::from_ref(record))
    }

    /// Append records in order, in one transaction.
    ///
    /// Returns the insertion sequence of the first record (the current count
    /// when `records` is empty).
    pub fn append_batch(&self, key: &JobKey, records: &[NewRecord]) -> Result<i64> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        let first: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), -1) + 1 FROM records WHERE cluster_id = ?1 AND topic = ?2",
            rusqlite::params![key.cluster_id, key.topic],
            |row| row.get(0),
        )?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO records
                 (cluster_id, topic, seq, partition_id, record_offset, timestamp_ms,
                  record_key, payload, decode_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            let mut seq = first;
            for record in records {
                stmt.execute(rusqlite::params![
                    key.cluster_id,
                    key.topic,
                    seq,
                    record.partition,
                    record.offset,
                    record.timestamp_ms,
                    record.key,
                    record.payload,
                    record.decode_error,
                ])?;
                seq += 1;
            }
        }

        tx.commit()?;
        Ok(first)
    }

    /// Number of rows cached for a topic.
    pub fn count(&self, key: &JobKey) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE cluster_id = ?1 AND topic = ?2",
            rusqlite::params![key.cluster_id, key.topic],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Up to `limit` records starting at row `offset`, in insertion order.
    pub fn page(&self, key: &JobKey, offset: i64, limit: usize) -> Result<Vec<ConsumedRecord>> {
        if offset < 0 {
            return Err(StorageError::OutOfRange(offset).into());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT seq, partition_id, record_offset, timestamp_ms, record_key, payload, decode_error
             FROM records
             WHERE cluster_id = ?1 AND topic = ?2 AND seq >= ?3
             ORDER BY seq
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![key.cluster_id, key.topic, offset, limit],
            |row| read_record(&key.topic, row),
        )?;
        let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Up to `limit` rows matching `filter`, skipping the first `offset`
    /// matches, in insertion order. Rows keep their own insertion sequence.
    pub fn query(
        &self,
        key: &JobKey,
        filter: &RecordFilter,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<ConsumedRecord>> {
        if offset < 0 {
            return Err(StorageError::OutOfRange(offset).into());
        }
        let (clause, mut params) = filter.where_clause(key);
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        params.push(Value::Integer(offset));
        let sql = format!(
            "SELECT seq, partition_id, record_offset, timestamp_ms, record_key, payload, decode_error
             FROM records
             WHERE {clause}
             ORDER BY seq
             LIMIT ? OFFSET ?"
        );

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| read_record(&key.topic, row))?;
        let records = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Number of rows matching `filter`.
    pub fn count_matching(&self, key: &JobKey, filter: &RecordFilter) -> Result<i64> {
        let (clause, params) = filter.where_clause(key);
        let sql = format!("SELECT COUNT(*) FROM records WHERE {clause}");
        let conn = self.conn()?;
        let count = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(count)
    }

    /// The record at a row index, if present.
    pub fn get(&self, key: &JobKey, row_index: i64) -> Result<Option<ConsumedRecord>> {
        if row_index < 0 {
            return Err(StorageError::OutOfRange(row_index).into());
        }
        Ok(self.page(key, row_index, 1)?.into_iter().next())
    }

    /// Highest offset stored for a partition.
    pub fn last_offset(&self, key: &JobKey, partition: i32) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let offset = conn
            .query_row(
                "SELECT MAX(record_offset) FROM records
                 WHERE cluster_id = ?1 AND topic = ?2 AND partition_id = ?3",
                rusqlite::params![key.cluster_id, key.topic, partition],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
        Ok(offset)
    }

    /// Every cached (cluster, topic) pair with its row count.
    pub fn topics(&self) -> Result<Vec<CachedTopic>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT cluster_id, topic, COUNT(*) FROM records
             GROUP BY cluster_id, topic
             ORDER BY cluster_id, topic",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CachedTopic {
                cluster_id: row.get(0)?,
                topic: row.get(1)?,
                records: row.get(2)?,
            })
        })?;
        let topics = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(topics)
    }
}

fn read_record(topic: &str, row: &Row<'_>) -> rusqlite::Result<ConsumedRecord> {
    Ok(ConsumedRecord {
        topic: topic.to_string(),
        insertion_seq: row.get(0)?,
        partition: row.get(1)?,
        offset: row.get(2)?,
        timestamp_ms: row.get(3)?,
        key: row.get(4)?,
        payload: row.get(5)?,
        decode_error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(topic: &str) -> JobKey {
        JobKey::new("local", topic)
    }

    fn record(partition: i32, offset: i64) -> NewRecord {
        NewRecord {
            partition,
            offset,
            timestamp_ms: Some(1_000 + offset),
            key: Some(format!("k{offset}")),
            payload: Some(format!("v{offset}")),
            decode_error: None,
        }
    }

    #[test]
    fn append_assigns_dense_sequence() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        assert_eq!(store.append(&k, &record(0, 10)).unwrap(), 0);
        assert_eq!(store.append(&k, &record(1, 3)).unwrap(), 1);
        let first = store
            .append_batch(&k, &[record(0, 11), record(0, 12)])
            .unwrap();
        assert_eq!(first, 2);
        assert_eq!(store.count(&k).unwrap(), 4);

        let page = store.page(&k, 0, 10).unwrap();
        let seqs: Vec<_> = page.iter().map(|r| r.insertion_seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(page[1].partition, 1);
        assert_eq!(page[1].offset, 3);
        assert_eq!(page[3].payload.as_deref(), Some("v12"));
    }

    #[test]
    fn page_windows_and_bounds() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        let batch: Vec<_> = (0..10).map(|o| record(0, o)).collect();
        store.append_batch(&k, &batch).unwrap();

        let page = store.page(&k, 4, 3).unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].insertion_seq, 4);
        assert_eq!(page[2].offset, 6);

        assert!(store.page(&k, 10, 5).unwrap().is_empty());
        assert!(store.page(&k, 0, 0).unwrap().is_empty());
        assert!(matches!(
            store.page(&k, -1, 1),
            Err(crate::Error::Storage(StorageError::OutOfRange(-1)))
        ));
    }

    #[test]
    fn topics_are_isolated() {
        let store = RecordStore::open_in_memory().unwrap();
        let a = key("a");
        let b = key("b");
        let other_cluster = JobKey::new("prod", "a");
        store.append(&a, &record(0, 0)).unwrap();
        store.append(&b, &record(0, 0)).unwrap();
        store.append(&b, &record(0, 1)).unwrap();
        store.append(&other_cluster, &record(0, 0)).unwrap();

        assert_eq!(store.count(&a).unwrap(), 1);
        assert_eq!(store.count(&b).unwrap(), 2);
        assert_eq!(store.count(&other_cluster).unwrap(), 1);
        assert_eq!(store.page(&b, 0, 10).unwrap()[1].insertion_seq, 1);

        let topics = store.topics().unwrap();
        assert_eq!(topics.len(), 3);
        assert_eq!(topics[0].topic, "a");
        assert_eq!(topics[0].cluster_id, "local");
    }

    #[test]
    fn clear_resets_sequence() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        store
            .append_batch(&k, &[record(0, 0), record(0, 1)])
            .unwrap();
        assert_eq!(store.clear(&k).unwrap(), 2);
        assert_eq!(store.count(&k).unwrap(), 0);
        assert_eq!(store.append(&k, &record(0, 5)).unwrap(), 0);
    }

    #[test]
    fn get_and_last_offset() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        assert_eq!(store.last_offset(&k, 0).unwrap(), None);
        store
            .append_batch(&k, &[record(0, 7), record(1, 2), record(0, 8)])
            .unwrap();
        assert_eq!(store.get(&k, 1).unwrap().unwrap().partition, 1);
        assert!(store.get(&k, 3).unwrap().is_none());
        assert_eq!(store.last_offset(&k, 0).unwrap(), Some(8));
    }

    #[test]
    fn decode_error_round_trips() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        let mut bad = record(0, 0);
        bad.payload = Some(crate::decoder::UNDECODABLE_PAYLOAD.to_string());
        bad.decode_error = Some("payload is not valid JSON".to_string());
        store.append(&k, &bad).unwrap();
        let stored = store.get(&k, 0).unwrap().unwrap();
        assert_eq!(stored.decode_error.as_deref(), Some("payload is not valid JSON"));
    }

    #[test]
    fn filtered_query_and_count() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        let mut batch: Vec<_> = (0..6).map(|o| record(o as i32 % 2, o)).collect();
        batch[3].payload = Some(r#"{"status":"failed"}"#.to_string());
        batch[5].payload = Some(r#"{"status":"failed","retry":true}"#.to_string());
        batch[4].key = None;
        store.append_batch(&k, &batch).unwrap();
        store.append(&key("other"), &batch[3]).unwrap();

        let all = RecordFilter::default();
        assert!(all.is_empty());
        assert_eq!(store.count_matching(&k, &all).unwrap(), 6);

        let failed = RecordFilter {
            payload_contains: Some("failed".to_string()),
            ..RecordFilter::default()
        };
        assert!(!failed.is_empty());
        assert_eq!(store.count_matching(&k, &failed).unwrap(), 2);
        let rows = store.query(&k, &failed, 0, 10).unwrap();
        let seqs: Vec<_> = rows.iter().map(|r| r.insertion_seq).collect();
        assert_eq!(seqs, vec![3, 5]);
        assert_eq!(rows[0].topic, "orders");

        // Offset and limit count matches, not rows.
        let odd = RecordFilter {
            partition: Some(1),
            ..RecordFilter::default()
        };
        let page = store.query(&k, &odd, 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].offset, 3);

        // A missing key never matches a key filter.
        let keyed = RecordFilter {
            key_contains: Some("k".to_string()),
            ..RecordFilter::default()
        };
        assert_eq!(store.count_matching(&k, &keyed).unwrap(), 5);

        let window = RecordFilter {
            from_timestamp_ms: Some(1_002),
            to_timestamp_ms: Some(1_004),
            partition: Some(0),
            ..RecordFilter::default()
        };
        let offsets: Vec<_> = store
            .query(&k, &window, 0, usize::MAX)
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![2, 4]);

        assert!(matches!(
            store.query(&k, &all, -1, 1),
            Err(crate::Error::Storage(StorageError::OutOfRange(-1)))
        ));
    }

    #[test]
    fn filter_matches_literal_substrings() {
        let store = RecordStore::open_in_memory().unwrap();
        let k = key("orders");
        let mut plain = record(0, 0);
        plain.payload = Some("100 percent".to_string());
        let mut wild = record(0, 1);
        wild.payload = Some("100% done".to_string());
        store.append_batch(&k, &[plain, wild]).unwrap();

        let filter = RecordFilter {
            payload_contains: Some("0%".to_string()),
            ..RecordFilter::default()
        };
        let rows = store.query(&k, &filter, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].offset, 1);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.db");
        let k = key("orders");
        {
            let store = RecordStore::open(&path, Duration::from_secs(5)).unwrap();
            store.append(&k, &record(0, 0)).unwrap();
            assert_eq!(store.path(), Some(path.as_path()));
        }
        let store = RecordStore::open(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(store.count(&k).unwrap(), 1);
    }
}
