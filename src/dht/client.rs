use crate::dht::protocol::Item;
use crate::dht::rpc::DhtRpc;
use crate::dht::traversal::{Operation, OperationInput, TraversalEvent, TraversalStats};
use crate::dht::{DhtConfig, NodeId, NodeInfo, RoutingTable};
use crate::record::{zbase32, Record, RecordError};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::Instant;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("value not found ({stats})")]
    NotFound { stats: TraversalStats },

    #[error("traversal timed out ({stats})")]
    Timeout { stats: TraversalStats },

    #[error("put failed: no node acknowledged ({stats})")]
    PutFailed { stats: TraversalStats },

    #[error("no known DHT nodes")]
    NoNodes,

    #[error("invalid id: {0}")]
    InvalidId(#[from] RecordError),
}

/// Result of a full get, carrying what is needed to rebuild a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullGetResult {
    pub value: Vec<u8>,
    pub seq: i64,
    pub signature: [u8; 64],
    pub mutable: bool,
}

impl FullGetResult {
    fn from_item(item: Item) -> Self {
        let mut signature = [0u8; 64];
        if let Some(sig) = item.signature.as_ref().filter(|s| s.len() == 64) {
            signature.copy_from_slice(sig);
        }

        Self {
            mutable: item.is_mutable(),
            seq: item.seq.unwrap_or(0),
            value: item.value,
            signature,
        }
    }
}

/// What the record service needs from the network.
#[async_trait]
pub trait RecordTransport: Send + Sync {
    /// Stores the record on the closest nodes and returns its id
    async fn put(&self, record: &Record, timeout: Duration) -> Result<String, TransportError>;

    /// Single-answer lookup of the value stored under `id`
    async fn get(&self, id: &str, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Lookup returning signature and sequence metadata
    async fn get_full(&self, id: &str, timeout: Duration) -> Result<FullGetResult, TransportError>;
}

/// DHT客户端：在路由表之上执行get/put遍历
#[derive(Clone)]
pub struct DhtClient {
    rpc: Arc<dyn DhtRpc>,
    routing: Arc<RwLock<RoutingTable>>,
    config: DhtConfig,
}

enum Outcome {
    Found(Item),
    NotFound,
    Timeout,
}

impl DhtClient {
    pub fn new(rpc: Arc<dyn DhtRpc>, routing: Arc<RwLock<RoutingTable>>, config: DhtConfig) -> Self {
        Self { rpc, routing, config }
    }

    fn input(&self, target: NodeId, seq: Option<i64>) -> OperationInput {
        OperationInput {
            target,
            seq,
            alpha: self.config.alpha,
            k: self.config.k,
            query_timeout: self.config.query_timeout,
        }
    }

    async fn start(&self, target: NodeId, seq: Option<i64>) -> Result<Operation, TransportError> {
        let seeds = self
            .routing
            .read()
            .await
            .get_closest(&target, self.config.k.max(self.config.alpha));
        if seeds.is_empty() {
            return Err(TransportError::NoNodes);
        }

        Ok(Operation::start(self.rpc.clone(), self.input(target, seq), seeds))
    }

    async fn learn(&self, nodes: &[NodeInfo]) {
        let mut routing = self.routing.write().await;
        for node in nodes {
            routing.update_node(node.clone());
        }
    }

    /// Finds the item at `target`. The highest sequence among mutable
    /// candidates wins, later arrivals winning ties; an immutable item ends
    /// the traversal at once.
    pub async fn get_item(&self, target: NodeId, seq: Option<i64>, timeout: Duration) -> Result<(Item, TraversalStats), TransportError> {
        let mut op = self.start(target, seq).await?;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let mut best: Option<Item> = None;
        let mut responders = Vec::new();
        let outcome = loop {
            tokio::select! {
                event = op.next_event() => match event {
                    Some(TraversalEvent::Candidate(item)) => {
                        debug!("Received candidate for {} with seq {:?}", target, item.seq);
                        if !item.is_mutable() {
                            break Outcome::Found(item);
                        }
                        let replace = match &best {
                            Some(current) => item.seq >= current.seq,
                            None => true,
                        };
                        if replace {
                            best = Some(item);
                        }
                    }
                    Some(TraversalEvent::Stalled { closest }) => {
                        responders = closest;
                        break match best.take() {
                            Some(item) => Outcome::Found(item),
                            None => Outcome::NotFound,
                        };
                    }
                    None => {
                        break match best.take() {
                            Some(item) => Outcome::Found(item),
                            None => Outcome::NotFound,
                        };
                    }
                },
                _ = &mut deadline => break Outcome::Timeout,
            }
        };

        let stats = op.stop();
        self.learn(&responders).await;

        match outcome {
            Outcome::Found(item) => Ok((item, stats)),
            Outcome::NotFound => Err(TransportError::NotFound { stats }),
            Outcome::Timeout => Err(TransportError::Timeout { stats }),
        }
    }

    /// Stores `item` on the closest responsive nodes to its target.
    pub async fn put_item(&self, item: &Item, timeout: Duration) -> Result<TraversalStats, TransportError> {
        let deadline = Instant::now() + timeout;
        let target = item.target();
        let mut op = self.start(target, None).await?;

        let closest = tokio::time::timeout_at(deadline, async {
            loop {
                match op.next_event().await {
                    Some(TraversalEvent::Stalled { closest }) => return closest,
                    Some(TraversalEvent::Candidate(_)) => continue,
                    None => return Vec::new(),
                }
            }
        })
        .await;

        let mut stats = op.stop();
        let closest = match closest {
            Ok(closest) => closest,
            Err(_) => return Err(TransportError::Timeout { stats }),
        };
        self.learn(&closest).await;

        let mut puts = JoinSet::new();
        for node in closest {
            let rpc = self.rpc.clone();
            let item = item.clone();
            puts.spawn(async move {
                let result = rpc.put(&node, &item).await;
                (node, result)
            });
        }

        let mut acks = 0;
        let mut tried = 0;
        let collected = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = puts.join_next().await {
                tried += 1;
                match joined {
                    Ok((_, Ok(()))) => acks += 1,
                    Ok((node, Err(e))) => debug!("Put to {} failed: {}", node.addr, e),
                    Err(e) => warn!("Put task failed: {}", e),
                }
            }
        })
        .await;

        stats.nodes_tried += tried;
        stats.responses += acks;

        if acks > 0 {
            debug!("Stored {} on {} nodes", target, acks);
            return Ok(stats);
        }

        match collected {
            Ok(()) => Err(TransportError::PutFailed { stats }),
            Err(_) => Err(TransportError::Timeout { stats }),
        }
    }
}

#[async_trait]
impl RecordTransport for DhtClient {
    async fn put(&self, record: &Record, timeout: Duration) -> Result<String, TransportError> {
        let id = record.id();
        match self.put_item(&record.put(), timeout).await {
            Ok(_) => Ok(id),
            Err(e) => {
                warn!("failed to put record<{}> into dht: {}", id, e);
                Err(e)
            }
        }
    }

    async fn get(&self, id: &str, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.get_full(id, timeout).await.map(|full| full.value)
    }

    async fn get_full(&self, id: &str, timeout: Duration) -> Result<FullGetResult, TransportError> {
        let key = zbase32::decode_id(id)?;
        let target = NodeId::for_mutable(&key, &[]);

        match self.get_item(target, None, timeout).await {
            Ok((item, stats)) => {
                debug!("resolved {} from dht ({})", id, stats);
                Ok(FullGetResult::from_item(item))
            }
            Err(e) => {
                debug!("failed to get {} from dht: {}", id, e);
                Err(e)
            }
        }
    }
}
