use crate::dht::item_store::ItemStore;
use crate::dht::protocol::DhtMessage;
use crate::dht::{NodeInfo, RoutingTable};
use log::debug;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Serves inbound DHT requests for one node. Shared by the UDP node and the
/// in-process network.
pub struct DhtHandler {
    local: NodeInfo,
    routing: Arc<RwLock<RoutingTable>>,
    items: Arc<ItemStore>,
    k: usize,
}

impl DhtHandler {
    pub fn new(local: NodeInfo, routing: Arc<RwLock<RoutingTable>>, items: Arc<ItemStore>, k: usize) -> Self {
        Self { local, routing, items, k }
    }

    pub fn local(&self) -> &NodeInfo {
        &self.local
    }

    pub fn routing(&self) -> Arc<RwLock<RoutingTable>> {
        self.routing.clone()
    }

    pub fn items(&self) -> Arc<ItemStore> {
        self.items.clone()
    }

    /// 处理请求并返回响应；响应消息本身不需要回复
    pub async fn handle(&self, from: SocketAddr, message: DhtMessage) -> Option<DhtMessage> {
        // 记录发送者，地址以实际来源为准
        let mut sender = message.sender().clone();
        sender.addr = from;
        self.routing.write().await.update_node(sender);

        let message_id = message.message_id();
        let reply = match message {
            DhtMessage::Ping { .. } => DhtMessage::Pong {
                sender: self.local.clone(),
                message_id,
            },
            DhtMessage::FindNodeRequest { target, .. } => DhtMessage::FindNodeResponse {
                sender: self.local.clone(),
                nodes: self.routing.read().await.get_closest(&target, self.k),
                message_id,
            },
            DhtMessage::GetRequest { target, seq, .. } => DhtMessage::GetResponse {
                sender: self.local.clone(),
                item: self.items.get(&target, seq).await,
                nodes: self.routing.read().await.get_closest(&target, self.k),
                message_id,
            },
            DhtMessage::PutRequest { item, .. } => {
                let target = item.target();
                match self.items.put(item).await {
                    Ok(()) => {
                        debug!("Stored item {} from {}", target, from);
                        DhtMessage::PutResponse {
                            sender: self.local.clone(),
                            success: true,
                            error: None,
                            message_id,
                        }
                    }
                    Err(e) => {
                        debug!("Rejected put for {} from {}: {}", target, from, e);
                        DhtMessage::PutResponse {
                            sender: self.local.clone(),
                            success: false,
                            error: Some(e.to_string()),
                            message_id,
                        }
                    }
                }
            }
            _ => return None,
        };

        Some(reply)
    }
}
