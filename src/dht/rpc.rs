use crate::dht::network::DhtNetwork;
use crate::dht::protocol::{DhtMessage, Item};
use crate::dht::{KademliaError, NodeId, NodeInfo};
use async_trait::async_trait;
use std::time::Duration;

/// Reply to a get query: the item if the node holds one, plus closer nodes.
#[derive(Debug, Clone)]
pub struct GetReply {
    pub item: Option<Item>,
    pub nodes: Vec<NodeInfo>,
}

/// Per-node DHT queries. Traversals are written against this trait so the
/// same lookup logic runs over UDP and over the in-process network.
#[async_trait]
pub trait DhtRpc: Send + Sync {
    /// The querying node
    fn local(&self) -> &NodeInfo;

    async fn ping(&self, to: &NodeInfo) -> Result<NodeInfo, KademliaError>;

    async fn find_node(&self, to: &NodeInfo, target: &NodeId) -> Result<Vec<NodeInfo>, KademliaError>;

    async fn get(&self, to: &NodeInfo, target: &NodeId, seq: Option<i64>) -> Result<GetReply, KademliaError>;

    async fn put(&self, to: &NodeInfo, item: &Item) -> Result<(), KademliaError>;
}

/// 基于UDP的RPC实现
#[derive(Clone)]
pub struct UdpRpc {
    network: DhtNetwork,
    local: NodeInfo,
    timeout: Duration,
}

impl UdpRpc {
    pub fn new(network: DhtNetwork, local: NodeInfo, timeout: Duration) -> Self {
        Self { network, local, timeout }
    }

    async fn request(&self, to: &NodeInfo, message: DhtMessage) -> Result<DhtMessage, KademliaError> {
        self.network.send_request(to.addr, message, self.timeout).await
    }
}

fn unexpected(addr: &NodeInfo, reply: &DhtMessage) -> KademliaError {
    KademliaError::OperationFailed(format!("Unexpected reply from {}: {:?}", addr.addr, reply))
}

#[async_trait]
impl DhtRpc for UdpRpc {
    fn local(&self) -> &NodeInfo {
        &self.local
    }

    async fn ping(&self, to: &NodeInfo) -> Result<NodeInfo, KademliaError> {
        let ping = DhtMessage::Ping { sender: self.local.clone(), message_id: 0 };
        match self.request(to, ping).await? {
            DhtMessage::Pong { mut sender, .. } => {
                sender.addr = to.addr;
                Ok(sender)
            }
            other => Err(unexpected(to, &other)),
        }
    }

    async fn find_node(&self, to: &NodeInfo, target: &NodeId) -> Result<Vec<NodeInfo>, KademliaError> {
        let request = DhtMessage::FindNodeRequest {
            sender: self.local.clone(),
            target: *target,
            message_id: 0,
        };
        match self.request(to, request).await? {
            DhtMessage::FindNodeResponse { nodes, .. } => Ok(nodes),
            other => Err(unexpected(to, &other)),
        }
    }

    async fn get(&self, to: &NodeInfo, target: &NodeId, seq: Option<i64>) -> Result<GetReply, KademliaError> {
        let request = DhtMessage::GetRequest {
            sender: self.local.clone(),
            target: *target,
            seq,
            message_id: 0,
        };
        match self.request(to, request).await? {
            DhtMessage::GetResponse { item, nodes, .. } => Ok(GetReply { item, nodes }),
            other => Err(unexpected(to, &other)),
        }
    }

    async fn put(&self, to: &NodeInfo, item: &Item) -> Result<(), KademliaError> {
        let request = DhtMessage::PutRequest {
            sender: self.local.clone(),
            item: item.clone(),
            message_id: 0,
        };
        match self.request(to, request).await? {
            DhtMessage::PutResponse { success: true, .. } => Ok(()),
            DhtMessage::PutResponse { error, .. } => {
                Err(KademliaError::Rejected(error.unwrap_or_else(|| "put rejected".to_string())))
            }
            other => Err(unexpected(to, &other)),
        }
    }
}
