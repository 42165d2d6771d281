use crate::dht::protocol::Item;
use crate::dht::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemStoreError {
    #[error("Item failed verification")]
    InvalidItem,

    #[error("Sequence number less than current: stored {current}, got {attempted}")]
    StaleSequence { current: i64, attempted: i64 },
}

/// 节点本地存储的条目
#[derive(Clone, Debug)]
struct StoredItem {
    item: Item,
    expiry: SystemTime,
}

impl StoredItem {
    fn is_expired(&self) -> bool {
        SystemTime::now() >= self.expiry
    }
}

/// Items a DHT node holds for other peers. Entries are forgotten after the
/// configured TTL unless re-put.
pub struct ItemStore {
    data: Arc<RwLock<HashMap<NodeId, StoredItem>>>,
    ttl: Duration,
}

impl ItemStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// 存储条目，可变条目需满足序列号仲裁规则
    pub async fn put(&self, item: Item) -> Result<(), ItemStoreError> {
        if !item.verify() {
            return Err(ItemStoreError::InvalidItem);
        }

        let target = item.target();
        let mut data = self.data.write().await;

        if let (Some(existing), Some(attempted)) = (data.get(&target), item.seq) {
            if !existing.is_expired() && existing.item != item {
                let current = existing.item.seq.unwrap_or(i64::MIN);
                if current >= attempted {
                    return Err(ItemStoreError::StaleSequence { current, attempted });
                }
            }
        }

        data.insert(target, StoredItem {
            item,
            expiry: SystemTime::now() + self.ttl,
        });
        Ok(())
    }

    /// 获取条目；min_seq不为空时，序列号不大于它的可变条目不返回值
    pub async fn get(&self, target: &NodeId, min_seq: Option<i64>) -> Option<Item> {
        let data = self.data.read().await;
        let stored = data.get(target).filter(|s| !s.is_expired())?;

        match (stored.item.seq, min_seq) {
            (Some(seq), Some(known)) if seq <= known => None,
            _ => Some(stored.item.clone()),
        }
    }

    /// 清理过期数据
    pub async fn cleanup_expired(&self) -> usize {
        let mut data = self.data.write().await;
        let before = data.len();
        data.retain(|_, stored| !stored.is_expired());
        before - data.len()
    }

    /// 丢弃全部条目
    pub async fn clear(&self) {
        self.data.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }
}
