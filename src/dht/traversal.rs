use crate::dht::protocol::Item;
use crate::dht::rpc::{DhtRpc, GetReply};
use crate::dht::{KademliaError, NodeId, NodeInfo, ID_LEN};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

/// 遍历统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalStats {
    pub nodes_tried: usize,
    pub responses: usize,
}

impl fmt::Display for TraversalStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tried {} nodes, got {} responses", self.nodes_tried, self.responses)
    }
}

#[derive(Default)]
struct Counters {
    nodes_tried: AtomicUsize,
    responses: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> TraversalStats {
        TraversalStats {
            nodes_tried: self.nodes_tried.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
        }
    }
}

/// Events reported by a running traversal, in arrival order.
#[derive(Debug)]
pub enum TraversalEvent {
    /// A node returned an item that verified against the target
    Candidate(Item),
    /// No closer unqueried nodes remain. Carries the closest nodes that answered.
    Stalled { closest: Vec<NodeInfo> },
}

#[derive(Debug, Clone)]
pub struct OperationInput {
    pub target: NodeId,
    /// Known sequence number; nodes holding nothing newer omit the item
    pub seq: Option<i64>,
    pub alpha: usize,
    pub k: usize,
    pub query_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Querying,
    Responded,
    Failed,
}

struct Entry {
    node: NodeInfo,
    state: NodeState,
}

/// 按到目标距离排序的候选节点
struct Shortlist {
    entries: BTreeMap<[u8; ID_LEN], Entry>,
    target: NodeId,
    k: usize,
}

impl Shortlist {
    fn new(target: NodeId, k: usize) -> Self {
        Self { entries: BTreeMap::new(), target, k }
    }

    fn add(&mut self, node: NodeInfo) {
        let distance = node.id.distance(&self.target);
        self.entries.entry(distance).or_insert(Entry { node, state: NodeState::Pending });
    }

    fn set_state(&mut self, id: &NodeId, state: NodeState) {
        if let Some(entry) = self.entries.get_mut(&id.distance(&self.target)) {
            entry.state = state;
        }
    }

    /// Closest pending node among the k closest nodes not known to have failed
    fn next_pending(&mut self) -> Option<NodeInfo> {
        let entry = self
            .entries
            .values_mut()
            .filter(|e| e.state != NodeState::Failed)
            .take(self.k)
            .find(|e| e.state == NodeState::Pending)?;
        entry.state = NodeState::Querying;
        Some(entry.node.clone())
    }

    fn closest_responders(&self) -> Vec<NodeInfo> {
        self.entries
            .values()
            .filter(|e| e.state == NodeState::Responded)
            .take(self.k)
            .map(|e| e.node.clone())
            .collect()
    }
}

/// A running get traversal. Each node query is its own task; results flow
/// through a channel to whoever drives [`Operation::next_event`].
/// Dropping or stopping the operation aborts every outstanding query.
pub struct Operation {
    events: mpsc::Receiver<TraversalEvent>,
    counters: Arc<Counters>,
    driver: JoinHandle<()>,
}

impl Operation {
    pub fn start(rpc: Arc<dyn DhtRpc>, input: OperationInput, seeds: Vec<NodeInfo>) -> Self {
        let (tx, events) = mpsc::channel(input.alpha.max(1));
        let counters = Arc::new(Counters::default());
        let driver = tokio::spawn(drive(rpc, input, seeds, tx, counters.clone()));

        Self { events, counters, driver }
    }

    /// Next event, or `None` once the traversal has ended and all events were read
    pub async fn next_event(&mut self) -> Option<TraversalEvent> {
        self.events.recv().await
    }

    /// 终止遍历并返回统计
    pub fn stop(self) -> TraversalStats {
        self.driver.abort();
        self.counters.snapshot()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn drive(
    rpc: Arc<dyn DhtRpc>,
    input: OperationInput,
    seeds: Vec<NodeInfo>,
    tx: mpsc::Sender<TraversalEvent>,
    counters: Arc<Counters>,
) {
    let local_id = rpc.local().id;
    let mut shortlist = Shortlist::new(input.target, input.k.max(1));
    for node in seeds.into_iter().filter(|n| n.id != local_id) {
        shortlist.add(node);
    }

    // JoinSet在drop时中止所有查询
    let mut queries: JoinSet<(NodeInfo, Result<GetReply, KademliaError>)> = JoinSet::new();

    loop {
        while queries.len() < input.alpha.max(1) {
            let node = match shortlist.next_pending() {
                Some(node) => node,
                None => break,
            };

            counters.nodes_tried.fetch_add(1, Ordering::Relaxed);
            let rpc = rpc.clone();
            let target = input.target;
            let seq = input.seq;
            let query_timeout = input.query_timeout;
            queries.spawn(async move {
                let result = match tokio::time::timeout(query_timeout, rpc.get(&node, &target, seq)).await {
                    Ok(result) => result,
                    Err(_) => Err(KademliaError::Timeout(format!("get to {}", node.addr))),
                };
                (node, result)
            });
        }

        let joined = match queries.join_next().await {
            Some(joined) => joined,
            None => break,
        };

        let (node, result) = match joined {
            Ok(r) => r,
            Err(e) => {
                warn!("Traversal query task failed: {}", e);
                continue;
            }
        };

        match result {
            Ok(reply) => {
                counters.responses.fetch_add(1, Ordering::Relaxed);
                shortlist.set_state(&node.id, NodeState::Responded);

                if let Some(item) = reply.item {
                    if item.matches(&input.target) {
                        if tx.send(TraversalEvent::Candidate(item)).await.is_err() {
                            return;
                        }
                    } else {
                        debug!("Item from {} did not match target {}", node.addr, input.target);
                    }
                }

                for peer in reply.nodes.into_iter().filter(|n| n.id != local_id) {
                    shortlist.add(peer);
                }
            }
            Err(e) => {
                debug!("Error querying {}: {}", node.addr, e);
                shortlist.set_state(&node.id, NodeState::Failed);
            }
        }
    }

    let closest = shortlist.closest_responders();
    let _ = tx.send(TraversalEvent::Stalled { closest }).await;
}
