use crate::dht::handler::DhtHandler;
use crate::dht::item_store::ItemStore;
use crate::dht::network::DhtNetwork;
use crate::dht::rpc::{DhtRpc, UdpRpc};
use crate::dht::{DhtClient, DhtConfig, KademliaError, NodeId, NodeInfo, RoutingTable};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// Mainline routers used when no bootstrap peers are configured
pub fn default_bootstrap_peers() -> Vec<String> {
    vec![
        "router.magnets.im:6881".to_string(),
        "router.bittorrent.com:6881".to_string(),
        "dht.transmissionbt.com:6881".to_string(),
        "router.utorrent.com:6881".to_string(),
        "router.nuh.dev:6881".to_string(),
    ]
}

/// A UDP DHT node: serves inbound requests and hands out a client that
/// runs traversals from this node.
pub struct DhtNode {
    network: DhtNetwork,
    handler: Arc<DhtHandler>,
    client: DhtClient,
    tasks: Vec<JoinHandle<()>>,
}

impl DhtNode {
    /// 绑定地址并启动节点
    pub async fn bind(listen_addr: SocketAddr, config: DhtConfig) -> Result<Self, KademliaError> {
        let (network, mut inbound) = DhtNetwork::new(listen_addr).await?;
        network.start();

        let local = NodeInfo::new(NodeId::random(), network.local_addr());
        let routing = Arc::new(RwLock::new(RoutingTable::new(local.id, config.k, config.node_ttl)));
        let items = Arc::new(ItemStore::new(config.item_ttl));
        let handler = Arc::new(DhtHandler::new(local.clone(), routing.clone(), items.clone(), config.k));

        let rpc = UdpRpc::new(network.clone(), local.clone(), config.query_timeout);
        let client = DhtClient::new(Arc::new(rpc), routing.clone(), config);

        let mut tasks = Vec::new();

        // 入站消息处理任务
        let serve_network = network.clone();
        let serve_handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(route) = inbound.recv().await {
                let network = serve_network.clone();
                let handler = serve_handler.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle(route.from, route.message).await {
                        if let Err(e) = network.send_response(route.from, reply).await {
                            debug!("Failed to reply to {}: {}", route.from, e);
                        }
                    }
                });
            }
        }));

        // 定期清理过期条目和节点
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let items_removed = items.cleanup_expired().await;
                let nodes_removed = routing.write().await.remove_expired();
                if items_removed + nodes_removed > 0 {
                    debug!("Expired {} items and {} nodes", items_removed, nodes_removed);
                }
            }
        }));

        info!("DHT node {} listening on {}", local.id, local.addr);

        Ok(Self { network, handler, client, tasks })
    }

    /// Pings each `host:port` peer and then looks up our own id through the
    /// ones that answered. Returns the routing table size.
    pub async fn bootstrap(&self, peers: &[String]) -> usize {
        let rpc = UdpRpc::new(self.network.clone(), self.handler.local().clone(), Duration::from_secs(5));
        let routing = self.handler.routing();
        let mut reachable = Vec::new();

        for peer in peers {
            let addrs = match tokio::net::lookup_host(peer.as_str()).await {
                Ok(addrs) => addrs.filter(|a| a.is_ipv4()).collect::<Vec<_>>(),
                Err(e) => {
                    warn!("Failed to resolve bootstrap peer {}: {}", peer, e);
                    continue;
                }
            };

            for addr in addrs {
                let probe = NodeInfo::new(NodeId([0u8; 20]), addr);
                match rpc.ping(&probe).await {
                    Ok(node) => {
                        routing.write().await.update_node(node.clone());
                        reachable.push(node);
                        break;
                    }
                    Err(e) => debug!("Bootstrap peer {} did not answer: {}", addr, e),
                }
            }
        }

        let local_id = self.handler.local().id;
        for node in &reachable {
            match rpc.find_node(node, &local_id).await {
                Ok(nodes) => {
                    let mut table = routing.write().await;
                    for found in nodes {
                        table.update_node(found);
                    }
                }
                Err(e) => debug!("find_node via {} failed: {}", node.addr, e),
            }
        }

        let size = routing.read().await.len();
        if reachable.is_empty() {
            warn!("No bootstrap peers reachable, waiting for inbound nodes");
        } else {
            info!("Bootstrapped via {} peers, routing table has {} nodes", reachable.len(), size);
        }
        size
    }

    pub fn client(&self) -> DhtClient {
        self.client.clone()
    }

    pub fn local(&self) -> &NodeInfo {
        self.handler.local()
    }

    /// 停止节点
    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.network.stop();
    }
}

impl Drop for DhtNode {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
