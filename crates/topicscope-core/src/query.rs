//! Read access to cached records.
//!
//! Reads may run while a consumer job appends to the same topic. Rows are
//! addressed by insertion sequence, which never changes once assigned, so a
//! row index keeps pointing at the same record until the topic is cleared.

use std::sync::Arc;

use crate::error::{ConsumerError, Result};
use crate::registry::JobKey;
use crate::store::{CachedTopic, ConsumedRecord, RecordFilter, RecordStore};

/// Async facade over [`RecordStore`] reads.
#[derive(Debug, Clone)]
pub struct QueryFacade {
    store: Arc<RecordStore>,
}

impl QueryFacade {
    #[must_use]
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&RecordStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    /// Rows cached for `key`. Zero when nothing was consumed yet.
    pub async fn record_count(&self, key: &JobKey) -> Result<i64> {
        let key = key.clone();
        self.blocking(move |store| store.count(&key)).await
    }

    /// The record at `row_index`. Fails with `RowNotFound` past the end.
    pub async fn fetch_record(&self, key: &JobKey, row_index: i64) -> Result<ConsumedRecord> {
        let key = key.clone();
        self.blocking(move |store| match store.get(&key, row_index)? {
            Some(record) => Ok(record),
            None => Err(ConsumerError::RowNotFound {
                row_index,
                count: store.count(&key)?,
            }
            .into()),
        })
        .await
    }

    /// Up to `limit` records starting at row `offset`.
    pub async fn fetch_records(
        &self,
        key: &JobKey,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<ConsumedRecord>> {
        let key = key.clone();
        self.blocking(move |store| store.page(&key, offset, limit))
            .await
    }

    /// Up to `limit` rows matching `filter`, skipping the first `offset`
    /// matches.
    pub async fn query_records(
        &self,
        key: &JobKey,
        filter: RecordFilter,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<ConsumedRecord>> {
        let key = key.clone();
        self.blocking(move |store| store.query(&key, &filter, offset, limit))
            .await
    }

    pub async fn count_matching(&self, key: &JobKey, filter: RecordFilter) -> Result<i64> {
        let key = key.clone();
        self.blocking(move |store| store.count_matching(&key, &filter))
            .await
    }

    /// Every cached topic with its row count.
    pub async fn cached_topics(&self) -> Result<Vec<CachedTopic>> {
        self.blocking(RecordStore::topics).await
    }
}
