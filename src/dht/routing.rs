use crate::dht::kademlia::{NodeId, NodeInfo, ID_LEN};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const BUCKET_COUNT: usize = ID_LEN * 8; // 桶的数量，对应NodeId的比特数

/// 路由表实现，基于Kademlia的k-bucket结构
pub struct RoutingTable {
    /// 本地节点ID
    local_id: NodeId,

    /// k-buckets，每个bucket存储距离在特定范围内的节点
    buckets: Vec<VecDeque<NodeInfo>>,

    /// 节点信息的哈希表，用于快速查找
    nodes: HashMap<NodeId, NodeInfo>,

    /// 每个k-bucket中存放的最大节点数
    bucket_size: usize,

    /// 节点记录的生存时间
    node_ttl: Duration,
}

impl RoutingTable {
    /// 创建新的路由表
    pub fn new(local_id: NodeId, bucket_size: usize, node_ttl: Duration) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(VecDeque::with_capacity(bucket_size));
        }

        Self {
            local_id,
            buckets,
            nodes: HashMap::new(),
            bucket_size,
            node_ttl,
        }
    }

    /// 计算应该放入哪个bucket
    fn bucket_index(&self, id: &NodeId) -> usize {
        let distance = self.local_id.distance(id);

        // 找到第一个非零字节
        for (i, &byte) in distance.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }

        // 如果所有字节都是0，这是本地节点自己
        BUCKET_COUNT - 1
    }

    /// 添加或更新节点，返回节点是否在表中
    pub fn update_node(&mut self, mut node: NodeInfo) -> bool {
        // 不添加本地节点
        if node.id == self.local_id {
            return false;
        }

        node.touch();
        let bucket_idx = self.bucket_index(&node.id);
        let bucket = &mut self.buckets[bucket_idx];

        // 节点已存在，移到队列末尾（最近看到的）
        if let Some(pos) = bucket.iter().position(|n| n.id == node.id) {
            bucket.remove(pos);
            bucket.push_back(node.clone());
            self.nodes.insert(node.id, node);
            return true;
        }

        if bucket.len() >= self.bucket_size {
            // Bucket已满，只有最久未见的节点过期时才替换
            let oldest_expired = bucket.front().map(|n| n.is_expired(self.node_ttl)).unwrap_or(false);
            if !oldest_expired {
                return false;
            }
            if let Some(oldest) = bucket.pop_front() {
                self.nodes.remove(&oldest.id);
            }
        }

        bucket.push_back(node.clone());
        self.nodes.insert(node.id, node);
        true
    }

    /// 移除无响应的节点
    pub fn remove_node(&mut self, id: &NodeId) -> Option<NodeInfo> {
        let bucket_idx = self.bucket_index(id);
        self.buckets[bucket_idx].retain(|n| n.id != *id);
        self.nodes.remove(id)
    }

    /// 获取特定节点信息
    pub fn get_node(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    /// 获取离目标最近的count个节点
    pub fn get_closest(&self, target: &NodeId, count: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<&NodeInfo> = self.nodes.values().collect();
        nodes.sort_by_key(|node| node.id.distance(target));
        nodes.into_iter().take(count).cloned().collect()
    }

    /// 清理过期节点
    pub fn remove_expired(&mut self) -> usize {
        let ttl = self.node_ttl;
        let mut removed = 0;

        for bucket in &mut self.buckets {
            let before_len = bucket.len();
            bucket.retain(|node| !node.is_expired(ttl));
            removed += before_len - bucket.len();
        }

        self.nodes.retain(|_, node| !node.is_expired(ttl));
        removed
    }

    /// 获取路由表中的节点总数
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 检查路由表是否为空
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
