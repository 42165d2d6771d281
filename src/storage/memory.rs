use crate::record::{FailedRecord, Record};
use crate::storage::{next_token, should_overwrite, RecordStore, StoreError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// 内存记录存储
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, Record>>,
    failed: RwLock<BTreeMap<String, FailedRecord>>,
    /// writes that actually changed a record
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that changed stored data
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn write_record(&self, record: &Record) -> Result<(), StoreError> {
        let id = record.id();
        let mut records = self.records.write().await;
        if should_overwrite(records.get(&id), record)? {
            records.insert(id, record.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn read_record(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list_records(&self, page_token: Option<&str>, page_size: usize) -> Result<(Vec<Record>, Option<String>), StoreError> {
        let records = self.records.read().await;
        let start = match page_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };

        let page: Vec<Record> = records
            .range((start, Bound::Unbounded))
            .take(page_size)
            .map(|(_, r)| r.clone())
            .collect();
        let next = next_token(&page, page_size);
        Ok((page, next))
    }

    async fn record_count(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }

    async fn write_failed_record(&self, failed: &FailedRecord) -> Result<(), StoreError> {
        let mut ledger = self.failed.write().await;
        let entry = ledger.entry(failed.id.clone()).or_insert_with(|| FailedRecord {
            id: failed.id.clone(),
            failure_count: 0,
        });
        entry.failure_count = entry.failure_count.saturating_add(failed.failure_count);
        Ok(())
    }

    async fn list_failed_records(&self) -> Result<Vec<FailedRecord>, StoreError> {
        Ok(self.failed.read().await.values().cloned().collect())
    }

    async fn failed_record_count(&self) -> Result<usize, StoreError> {
        Ok(self.failed.read().await.len())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[tokio::test]
    async fn test_identical_write_is_noop() {
        let store = MemoryStore::new();
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, b"v", 1).unwrap();

        store.write_record(&record).await.unwrap();
        store.write_record(&record).await.unwrap();
        assert_eq!(store.write_count(), 1);

        // 同序列号但内容不同的记录被拒绝
        let rival = Record::sign(&kp, b"w", 1).unwrap();
        assert!(matches!(
            store.write_record(&rival).await,
            Err(StoreError::StaleSequence { stored: 1, attempted: 1 })
        ));
        assert_eq!(store.read_record(&record.id()).await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_pages_cover_all_records() {
        let store = MemoryStore::new();
        for _ in 0..4 {
            let kp = KeyPair::generate().unwrap();
            store.write_record(&Record::sign(&kp, b"x", 1).unwrap()).await.unwrap();
        }

        let (first, token) = store.list_records(None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let (second, token) = store.list_records(token.as_deref(), 3).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(token.is_none());
    }
}
