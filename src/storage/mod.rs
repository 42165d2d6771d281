mod database;
mod memory;

pub use database::SledStore;
pub use memory::MemoryStore;

use crate::record::{FailedRecord, Record, RecordError};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DbError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt record {id}: {source}")]
    Corrupt { id: String, source: RecordError },

    #[error("Stale sequence: stored {stored}, attempted {attempted}")]
    StaleSequence { stored: i64, attempted: i64 },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// 持久化记录存储接口
///
/// Records are keyed by their z-base-32 id and overwritten only by a record
/// with a strictly higher sequence number. A completed write is visible to
/// every later read.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite. Writing an identical record is a no-op;
    /// a different record with a sequence not above the stored one fails
    /// with [`StoreError::StaleSequence`].
    async fn write_record(&self, record: &Record) -> Result<(), StoreError>;

    async fn read_record(&self, id: &str) -> Result<Option<Record>, StoreError>;

    /// One page of records in id order, starting after `page_token`.
    /// A `None` next token means there is nothing left.
    async fn list_records(&self, page_token: Option<&str>, page_size: usize) -> Result<(Vec<Record>, Option<String>), StoreError>;

    async fn record_count(&self) -> Result<usize, StoreError>;

    /// Adds `failed.failure_count` to the ledger entry for `failed.id`.
    async fn write_failed_record(&self, failed: &FailedRecord) -> Result<(), StoreError>;

    async fn list_failed_records(&self) -> Result<Vec<FailedRecord>, StoreError>;

    async fn failed_record_count(&self) -> Result<usize, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

/// 判断是否需要写入：相同记录无需写入，旧序列号拒绝
pub(crate) fn should_overwrite(existing: Option<&Record>, incoming: &Record) -> Result<bool, StoreError> {
    match existing {
        None => Ok(true),
        Some(current) if current == incoming => Ok(false),
        Some(current) if current.sequence >= incoming.sequence => Err(StoreError::StaleSequence {
            stored: current.sequence,
            attempted: incoming.sequence,
        }),
        Some(_) => Ok(true),
    }
}

/// The last id of a full page, or `None` when the page came back short.
pub(crate) fn next_token(records: &[Record], page_size: usize) -> Option<String> {
    if page_size > 0 && records.len() == page_size {
        records.last().map(|r| r.id())
    } else {
        None
    }
}

/*
 * Durable record storage
 *
 * - SledStore: sled trees `records` and `failed`
 * - MemoryStore: in-process maps for tests and ephemeral nodes
 */
