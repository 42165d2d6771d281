mod client;
mod handler;
mod item_store;
mod kademlia;
mod memory;
mod network;
mod node;
mod protocol;
mod routing;
mod rpc;
mod traversal;

pub use client::{DhtClient, FullGetResult, RecordTransport, TransportError};
pub use handler::DhtHandler;
pub use item_store::{ItemStore, ItemStoreError};
pub use kademlia::{DhtConfig, KademliaError, NodeId, NodeInfo, ID_LEN};
pub use memory::{MemoryNetwork, MemoryRpc};
pub use network::DhtNetwork;
pub use node::{default_bootstrap_peers, DhtNode};
pub use protocol::{DhtMessage, Item, MessageRoute, RequestContext};
pub use routing::RoutingTable;
pub use rpc::{DhtRpc, GetReply, UdpRpc};
pub use traversal::{Operation, OperationInput, TraversalEvent, TraversalStats};

/*
 * BEP-44 DHT layer
 *
 * Kademlia node (UDP transport, k-bucket routing, local item store with
 * sequence arbitration) plus the client side used by the record service:
 * parallel get/put traversals over the `DhtRpc` seam. `MemoryNetwork`
 * runs the same handlers in-process.
 */
