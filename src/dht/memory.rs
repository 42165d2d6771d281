use crate::dht::handler::DhtHandler;
use crate::dht::item_store::ItemStore;
use crate::dht::protocol::{DhtMessage, Item};
use crate::dht::rpc::{DhtRpc, GetReply};
use crate::dht::{DhtClient, DhtConfig, KademliaError, NodeId, NodeInfo, RoutingTable};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// In-process DHT: every node is a [`DhtHandler`] addressed by a fake
/// socket address, and requests are delivered by direct calls. Used by tests
/// and local demos.
pub struct MemoryNetwork {
    nodes: StdRwLock<HashMap<SocketAddr, Arc<DhtHandler>>>,
    failing_targets: StdRwLock<HashSet<NodeId>>,
    offline: AtomicBool,
    next_port: AtomicU16,
    config: DhtConfig,
}

impl MemoryNetwork {
    pub fn new(config: DhtConfig) -> Arc<Self> {
        Arc::new(Self {
            nodes: StdRwLock::new(HashMap::new()),
            failing_targets: StdRwLock::new(HashSet::new()),
            offline: AtomicBool::new(false),
            next_port: AtomicU16::new(10000),
            config,
        })
    }

    fn handler(&self, addr: &SocketAddr) -> Option<Arc<DhtHandler>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(addr).cloned()
    }

    fn handlers(&self) -> Vec<Arc<DhtHandler>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }

    fn add_node(&self) -> Arc<DhtHandler> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let local = NodeInfo::new(NodeId::random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        let routing = Arc::new(RwLock::new(RoutingTable::new(local.id, self.config.k, self.config.node_ttl)));
        let items = Arc::new(ItemStore::new(self.config.item_ttl));
        let handler = Arc::new(DhtHandler::new(local.clone(), routing, items, self.config.k));

        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local.addr, handler.clone());
        handler
    }

    /// Adds `count` nodes that all know each other.
    pub async fn spawn_nodes(&self, count: usize) -> Vec<NodeInfo> {
        let added: Vec<Arc<DhtHandler>> = (0..count).map(|_| self.add_node()).collect();

        for handler in self.handlers() {
            let routing = handler.routing();
            let mut table = routing.write().await;
            for other in &added {
                table.update_node(other.local().clone());
            }
        }
        for handler in &added {
            let routing = handler.routing();
            let mut table = routing.write().await;
            for other in self.handlers() {
                table.update_node(other.local().clone());
            }
        }

        added.iter().map(|h| h.local().clone()).collect()
    }

    /// A client joined as a node of its own, seeded with every existing node.
    pub async fn client(self: &Arc<Self>) -> DhtClient {
        let existing = self.handlers();
        let handler = self.add_node();
        let routing = handler.routing();
        {
            let mut table = routing.write().await;
            for other in existing {
                table.update_node(other.local().clone());
            }
        }

        let rpc = MemoryRpc {
            network: self.clone(),
            local: handler.local().clone(),
        };
        DhtClient::new(Arc::new(rpc), routing, self.config.clone())
    }

    /// Every put to `target` is rejected from now on
    pub fn fail_puts_for(&self, target: NodeId) {
        self.failing_targets.write().unwrap_or_else(PoisonError::into_inner).insert(target);
    }

    /// 模拟网络不可达
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of nodes currently holding an item for `target`
    pub async fn holders(&self, target: &NodeId) -> usize {
        let mut count = 0;
        for handler in self.handlers() {
            if handler.items().get(target, None).await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Stores `item` directly on one node, bypassing the put path.
    pub async fn seed_item(&self, node: &NodeInfo, item: Item) -> Result<(), KademliaError> {
        let handler = self
            .handler(&node.addr)
            .ok_or_else(|| KademliaError::InvalidNodeInfo(format!("unknown node {}", node.addr)))?;
        handler
            .items()
            .put(item)
            .await
            .map_err(|e| KademliaError::Rejected(e.to_string()))
    }

    /// 所有节点遗忘已存储的条目
    pub async fn forget_all(&self) {
        for handler in self.handlers() {
            handler.items().clear().await;
        }
    }

    async fn deliver(&self, from: &NodeInfo, to: &NodeInfo, message: DhtMessage) -> Result<DhtMessage, KademliaError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KademliaError::Timeout(format!("{} unreachable", to.addr)));
        }

        if let DhtMessage::PutRequest { item, .. } = &message {
            let failing = self
                .failing_targets
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&item.target());
            if failing {
                return Err(KademliaError::Rejected("simulated put failure".to_string()));
            }
        }

        let handler = self
            .handler(&to.addr)
            .ok_or_else(|| KademliaError::Timeout(format!("{} unreachable", to.addr)))?;
        handler
            .handle(from.addr, message)
            .await
            .ok_or_else(|| KademliaError::OperationFailed("no reply".to_string()))
    }
}

/// [`DhtRpc`] over a [`MemoryNetwork`]
pub struct MemoryRpc {
    network: Arc<MemoryNetwork>,
    local: NodeInfo,
}

#[async_trait]
impl DhtRpc for MemoryRpc {
    fn local(&self) -> &NodeInfo {
        &self.local
    }

    async fn ping(&self, to: &NodeInfo) -> Result<NodeInfo, KademliaError> {
        let ping = DhtMessage::Ping { sender: self.local.clone(), message_id: 0 };
        match self.network.deliver(&self.local, to, ping).await? {
            DhtMessage::Pong { sender, .. } => Ok(sender),
            other => Err(KademliaError::OperationFailed(format!("unexpected reply {:?}", other))),
        }
    }

    async fn find_node(&self, to: &NodeInfo, target: &NodeId) -> Result<Vec<NodeInfo>, KademliaError> {
        let request = DhtMessage::FindNodeRequest { sender: self.local.clone(), target: *target, message_id: 0 };
        match self.network.deliver(&self.local, to, request).await? {
            DhtMessage::FindNodeResponse { nodes, .. } => Ok(nodes),
            other => Err(KademliaError::OperationFailed(format!("unexpected reply {:?}", other))),
        }
    }

    async fn get(&self, to: &NodeInfo, target: &NodeId, seq: Option<i64>) -> Result<GetReply, KademliaError> {
        let request = DhtMessage::GetRequest { sender: self.local.clone(), target: *target, seq, message_id: 0 };
        match self.network.deliver(&self.local, to, request).await? {
            DhtMessage::GetResponse { item, nodes, .. } => Ok(GetReply { item, nodes }),
            other => Err(KademliaError::OperationFailed(format!("unexpected reply {:?}", other))),
        }
    }

    async fn put(&self, to: &NodeInfo, item: &Item) -> Result<(), KademliaError> {
        let request = DhtMessage::PutRequest { sender: self.local.clone(), item: item.clone(), message_id: 0 };
        match self.network.deliver(&self.local, to, request).await? {
            DhtMessage::PutResponse { success: true, .. } => Ok(()),
            DhtMessage::PutResponse { error, .. } => {
                Err(KademliaError::Rejected(error.unwrap_or_else(|| "put rejected".to_string())))
            }
            other => Err(KademliaError::OperationFailed(format!("unexpected reply {:?}", other))),
        }
    }
}
