use crate::record::{zbase32, FailedRecord, Record};
use crate::storage::{should_overwrite, RecordStore, StoreError};
use async_trait::async_trait;
use log::{debug, info, warn};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionError};
use sled::{Db, Tree};
use std::ops::Bound;
use std::path::Path;

const RECORDS_TREE: &str = "records";
const FAILED_TREE: &str = "failed";

/// 基于sled的记录存储
#[derive(Clone)]
pub struct SledStore {
    /// sled数据库实例
    db: Db,
    records: Tree,
    failed: Tree,
}

impl SledStore {
    /// 打开（或创建）数据库
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path.as_ref())?;
        let records = db.open_tree(RECORDS_TREE)?;
        let failed = db.open_tree(FAILED_TREE)?;

        info!("Opened record store at {}", path.as_ref().display());
        Ok(Self { db, records, failed })
    }

    fn decode_record(id: &[u8], wire: &[u8]) -> Result<Record, StoreError> {
        let id = String::from_utf8_lossy(id).into_owned();
        let key = match zbase32::decode_id(&id) {
            Ok(key) => key,
            Err(source) => return Err(StoreError::Corrupt { id, source }),
        };
        Record::from_wire(&key, wire).map_err(|source| StoreError::Corrupt { id, source })
    }

    fn decode_failed(bytes: &[u8]) -> Result<FailedRecord, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::SerializationError(e.to_string()))
    }
}

fn abort(e: TransactionError<StoreError>) -> StoreError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StoreError::DbError(e),
    }
}

#[async_trait]
impl RecordStore for SledStore {
    async fn write_record(&self, record: &Record) -> Result<(), StoreError> {
        let id = record.id();
        let wire = record.to_wire();

        // 读取、比较和写入在同一事务中完成
        let written = self
            .records
            .transaction(|tx| -> ConflictableTransactionResult<bool, StoreError> {
                let existing = match tx.get(id.as_bytes())? {
                    Some(bytes) => Some(
                        Self::decode_record(id.as_bytes(), &bytes).map_err(ConflictableTransactionError::Abort)?,
                    ),
                    None => None,
                };

                if !should_overwrite(existing.as_ref(), record).map_err(ConflictableTransactionError::Abort)? {
                    return Ok(false);
                }
                tx.insert(id.as_bytes(), wire.as_slice())?;
                Ok(true)
            })
            .map_err(abort)?;

        if written {
            debug!("Stored record<{}> seq {}", id, record.sequence);
        }
        Ok(())
    }

    async fn read_record(&self, id: &str) -> Result<Option<Record>, StoreError> {
        match self.records.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_record(id.as_bytes(), &bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_records(&self, page_token: Option<&str>, page_size: usize) -> Result<(Vec<Record>, Option<String>), StoreError> {
        let iter = match page_token {
            Some(token) => self
                .records
                .range::<&[u8], _>((Bound::Excluded(token.as_bytes()), Bound::Unbounded)),
            None => self.records.iter(),
        };

        // 损坏的行跳过，但翻页令牌仍越过它们
        let mut records = Vec::with_capacity(page_size);
        let mut scanned = 0;
        let mut last_key = None;
        for entry in iter.take(page_size) {
            let (id, wire) = entry?;
            scanned += 1;
            match Self::decode_record(&id, &wire) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record row: {}", e),
            }
            last_key = Some(id);
        }

        let next = if page_size > 0 && scanned == page_size {
            last_key.map(|key| String::from_utf8_lossy(&key).into_owned())
        } else {
            None
        };
        Ok((records, next))
    }

    async fn record_count(&self) -> Result<usize, StoreError> {
        Ok(self.records.len())
    }

    async fn write_failed_record(&self, failed: &FailedRecord) -> Result<(), StoreError> {
        self.failed
            .transaction(|tx| -> ConflictableTransactionResult<(), StoreError> {
                let previous = match tx.get(failed.id.as_bytes())? {
                    Some(bytes) => Self::decode_failed(&bytes)
                        .map_err(ConflictableTransactionError::Abort)?
                        .failure_count,
                    None => 0,
                };

                let entry = FailedRecord {
                    id: failed.id.clone(),
                    failure_count: previous.saturating_add(failed.failure_count),
                };
                let bytes = bincode::serialize(&entry)
                    .map_err(|e| ConflictableTransactionError::Abort(StoreError::SerializationError(e.to_string())))?;
                tx.insert(failed.id.as_bytes(), bytes)?;
                Ok(())
            })
            .map_err(abort)
    }

    async fn list_failed_records(&self) -> Result<Vec<FailedRecord>, StoreError> {
        let mut failed = Vec::new();
        for entry in self.failed.iter() {
            let (_, bytes) = entry?;
            failed.push(Self::decode_failed(&bytes)?);
        }
        Ok(failed)
    }

    async fn failed_record_count(&self) -> Result<usize, StoreError> {
        Ok(self.failed.len())
    }

    /// 刷新数据库
    async fn close(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        info!("Record store flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_read_and_arbitration() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        let kp = KeyPair::generate().unwrap();

        let v2 = Record::sign(&kp, b"two", 2).unwrap();
        store.write_record(&v2).await.unwrap();
        // 相同记录再次写入不报错
        store.write_record(&v2).await.unwrap();

        let v1 = Record::sign(&kp, b"one", 1).unwrap();
        let err = store.write_record(&v1).await.unwrap_err();
        assert!(matches!(err, StoreError::StaleSequence { stored: 2, attempted: 1 }));
        assert_eq!(store.read_record(&v2.id()).await.unwrap(), Some(v2.clone()));

        let v3 = Record::sign(&kp, b"three", 3).unwrap();
        store.write_record(&v3).await.unwrap();
        assert_eq!(store.read_record(&v3.id()).await.unwrap(), Some(v3));
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pagination() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        for _ in 0..5 {
            let kp = KeyPair::generate().unwrap();
            store.write_record(&Record::sign(&kp, b"x", 1).unwrap()).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0;
        loop {
            let (page, next) = store.list_records(token.as_deref(), 2).await.unwrap();
            pages += 1;
            seen.extend(page.into_iter().map(|r| r.id()));
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }

        assert_eq!(pages, 3);
        assert_eq!(seen.len(), 5);
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, seen);
    }

    #[tokio::test]
    async fn test_pagination_skips_corrupt_rows() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        for _ in 0..5 {
            let kp = KeyPair::generate().unwrap();
            store.write_record(&Record::sign(&kp, b"x", 1).unwrap()).await.unwrap();
        }
        store.records.insert("1", b"garbage".to_vec()).unwrap();

        let mut seen = 0;
        let mut token: Option<String> = None;
        loop {
            let (page, next) = store.list_records(token.as_deref(), 2).await.unwrap();
            seen += page.len();
            match next {
                Some(t) => token = Some(t),
                None => break,
            }
        }

        assert_eq!(seen, 5);
        assert!(store.read_record("1").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_ledger_accumulates() {
        let dir = tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        let failed = FailedRecord { id: "abc".to_string(), failure_count: 3 };
        store.write_failed_record(&failed).await.unwrap();
        store.write_failed_record(&failed).await.unwrap();

        assert_eq!(store.failed_record_count().await.unwrap(), 1);
        assert_eq!(store.list_failed_records().await.unwrap()[0].failure_count, 6);
    }
}
