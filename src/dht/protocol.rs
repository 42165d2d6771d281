use crate::crypto::verify_bep44;
use crate::dht::{NodeId, NodeInfo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// 可变条目值的最大字节数
pub const MAX_ITEM_VALUE: usize = 1000;

/// A BEP-44 item as carried on the wire. Mutable items carry the owner key,
/// a signature and a sequence number; immutable items carry only the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub value: Vec<u8>,
    pub key: Option<[u8; 32]>,
    pub signature: Option<Vec<u8>>,
    pub seq: Option<i64>,
    pub salt: Vec<u8>,
}

impl Item {
    pub fn mutable(key: [u8; 32], value: Vec<u8>, signature: [u8; 64], seq: i64) -> Self {
        Self {
            value,
            key: Some(key),
            signature: Some(signature.to_vec()),
            seq: Some(seq),
            salt: Vec::new(),
        }
    }

    pub fn immutable(value: Vec<u8>) -> Self {
        Self {
            value,
            key: None,
            signature: None,
            seq: None,
            salt: Vec::new(),
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.key.is_some()
    }

    /// DHT中的存储位置
    pub fn target(&self) -> NodeId {
        match &self.key {
            Some(key) => NodeId::for_mutable(key, &self.salt),
            None => NodeId::for_immutable(&self.value),
        }
    }

    /// Checks size limits and, for mutable items, the signature.
    pub fn verify(&self) -> bool {
        if self.value.len() > MAX_ITEM_VALUE {
            return false;
        }

        match (&self.key, &self.signature, self.seq) {
            (Some(key), Some(sig), Some(seq)) => verify_bep44(key, &self.salt, seq, &self.value, sig),
            (None, None, None) => true,
            _ => false,
        }
    }

    /// Checks that the item is well-formed and actually lives at `target`.
    pub fn matches(&self, target: &NodeId) -> bool {
        self.target() == *target && self.verify()
    }
}

/// DHT网络协议消息定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DhtMessage {
    /// Ping消息 - 用于检查节点是否在线
    Ping {
        sender: NodeInfo,
        message_id: u64,
    },

    /// Pong消息 - Ping的响应
    Pong {
        sender: NodeInfo,
        message_id: u64,
    },

    /// FindNode请求 - 查找离目标最近的k个节点
    FindNodeRequest {
        sender: NodeInfo,
        target: NodeId,
        message_id: u64,
    },

    /// FindNode响应 - 返回找到的节点列表
    FindNodeResponse {
        sender: NodeInfo,
        nodes: Vec<NodeInfo>,
        message_id: u64,
    },

    /// Get请求 - 查找目标条目；seq为已知序列号，不比它新的条目不会返回
    GetRequest {
        sender: NodeInfo,
        target: NodeId,
        seq: Option<i64>,
        message_id: u64,
    },

    /// Get响应 - 返回条目（如果有）以及更近的节点
    GetResponse {
        sender: NodeInfo,
        item: Option<Item>,
        nodes: Vec<NodeInfo>,
        message_id: u64,
    },

    /// Put请求 - 存储条目
    PutRequest {
        sender: NodeInfo,
        item: Item,
        message_id: u64,
    },

    /// Put响应 - 确认存储结果
    PutResponse {
        sender: NodeInfo,
        success: bool,
        error: Option<String>,
        message_id: u64,
    },
}

impl DhtMessage {
    /// 获取消息的发送者信息
    pub fn sender(&self) -> &NodeInfo {
        match self {
            DhtMessage::Ping { sender, .. } => sender,
            DhtMessage::Pong { sender, .. } => sender,
            DhtMessage::FindNodeRequest { sender, .. } => sender,
            DhtMessage::FindNodeResponse { sender, .. } => sender,
            DhtMessage::GetRequest { sender, .. } => sender,
            DhtMessage::GetResponse { sender, .. } => sender,
            DhtMessage::PutRequest { sender, .. } => sender,
            DhtMessage::PutResponse { sender, .. } => sender,
        }
    }

    /// 获取消息ID
    pub fn message_id(&self) -> u64 {
        match self {
            DhtMessage::Ping { message_id, .. } => *message_id,
            DhtMessage::Pong { message_id, .. } => *message_id,
            DhtMessage::FindNodeRequest { message_id, .. } => *message_id,
            DhtMessage::FindNodeResponse { message_id, .. } => *message_id,
            DhtMessage::GetRequest { message_id, .. } => *message_id,
            DhtMessage::GetResponse { message_id, .. } => *message_id,
            DhtMessage::PutRequest { message_id, .. } => *message_id,
            DhtMessage::PutResponse { message_id, .. } => *message_id,
        }
    }

    /// 设置消息ID（由网络层在发送请求时分配）
    pub fn set_message_id(&mut self, id: u64) {
        match self {
            DhtMessage::Ping { message_id, .. }
            | DhtMessage::Pong { message_id, .. }
            | DhtMessage::FindNodeRequest { message_id, .. }
            | DhtMessage::FindNodeResponse { message_id, .. }
            | DhtMessage::GetRequest { message_id, .. }
            | DhtMessage::GetResponse { message_id, .. }
            | DhtMessage::PutRequest { message_id, .. }
            | DhtMessage::PutResponse { message_id, .. } => *message_id = id,
        }
    }

    /// Whether this message answers a request
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::Pong { .. }
                | DhtMessage::FindNodeResponse { .. }
                | DhtMessage::GetResponse { .. }
                | DhtMessage::PutResponse { .. }
        )
    }

    /// 序列化消息为字节
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// 从字节反序列化消息
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// 网络请求的上下文信息
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 请求的目标地址
    pub target_addr: SocketAddr,
    /// 请求的超时时间
    pub timeout: Duration,
    /// 请求发送时间
    pub sent_at: SystemTime,
}

impl RequestContext {
    pub fn new(target_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            target_addr,
            timeout,
            sent_at: SystemTime::now(),
        }
    }

    /// 检查请求是否超时
    pub fn is_expired(&self) -> bool {
        match SystemTime::now().duration_since(self.sent_at) {
            Ok(elapsed) => elapsed > self.timeout,
            Err(_) => false,
        }
    }
}

/// 入站消息
#[derive(Debug, Clone)]
pub struct MessageRoute {
    /// 发送者地址
    pub from: SocketAddr,
    /// 消息内容
    pub message: DhtMessage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sign_bep44, KeyPair};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_node() -> NodeInfo {
        NodeInfo::new(NodeId::random(), SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000))
    }

    #[test]
    fn test_message_serialization() {
        let mut message = DhtMessage::GetRequest {
            sender: test_node(),
            target: NodeId::random(),
            seq: Some(3),
            message_id: 0,
        };
        message.set_message_id(12345);

        let bytes = message.to_bytes().unwrap();
        let deserialized = DhtMessage::from_bytes(&bytes).unwrap();

        assert_eq!(deserialized.message_id(), 12345);
        assert!(!deserialized.is_response());
        match deserialized {
            DhtMessage::GetRequest { seq, .. } => assert_eq!(seq, Some(3)),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_item_verification() {
        let kp = KeyPair::generate().unwrap();
        let sig = sign_bep44(&kp, b"", 7, b"value");
        let item = Item::mutable(kp.public.to_bytes(), b"value".to_vec(), sig, 7);

        assert!(item.matches(&NodeId::for_mutable(&kp.public.to_bytes(), b"")));
        assert!(!item.matches(&NodeId::random()));

        let mut forged = item.clone();
        forged.seq = Some(8);
        assert!(!forged.verify());

        let immutable = Item::immutable(b"blob".to_vec());
        assert!(immutable.matches(&NodeId::for_immutable(b"blob")));
        assert!(!Item::immutable(vec![0u8; 1001]).verify());
    }

    #[test]
    fn test_request_context_timeout() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000);
        let context = RequestContext::new(addr, Duration::from_millis(50));
        assert!(!context.is_expired());

        std::thread::sleep(Duration::from_millis(80));
        assert!(context.is_expired());
    }
}
