use crate::dht::protocol::{DhtMessage, MessageRoute, RequestContext};
use crate::dht::KademliaError;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};

/// 单个UDP数据报的上限
const MAX_DATAGRAM: usize = 65_507;
const INBOUND_QUEUE: usize = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

type Waiters = HashMap<u64, (oneshot::Sender<DhtMessage>, RequestContext)>;

fn encode(message: &DhtMessage) -> Result<Vec<u8>, KademliaError> {
    let bytes = message
        .to_bytes()
        .map_err(|e| KademliaError::OperationFailed(format!("encode: {}", e)))?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(KademliaError::OperationFailed(format!("message of {} bytes exceeds a datagram", bytes.len())));
    }
    Ok(bytes)
}

fn lock(waiters: &Mutex<Waiters>) -> MutexGuard<'_, Waiters> {
    waiters.lock().unwrap_or_else(PoisonError::into_inner)
}

/// UDP transport for [`DhtMessage`]s. Requests are matched to responses by
/// message id; everything that is not a response goes to the inbound queue.
#[derive(Clone)]
pub struct DhtNetwork {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// 等待响应的请求
    waiters: Arc<Mutex<Waiters>>,
    next_id: Arc<AtomicU64>,
    inbound: mpsc::Sender<MessageRoute>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl DhtNetwork {
    /// 绑定UDP端口，返回网络和入站消息队列
    pub async fn new(bind_addr: SocketAddr) -> Result<(Self, mpsc::Receiver<MessageRoute>), KademliaError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| KademliaError::OperationFailed(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| KademliaError::OperationFailed(format!("local address: {}", e)))?;

        let (inbound, queue) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown, _) = watch::channel(false);

        let network = Self {
            socket: Arc::new(socket),
            local_addr,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            inbound,
            shutdown: Arc::new(shutdown),
        };
        Ok((network, queue))
    }

    /// Starts the receive loop and the expired-request sweeper.
    pub fn start(&self) {
        tokio::spawn(Self::receive_loop(
            self.socket.clone(),
            self.waiters.clone(),
            self.inbound.clone(),
            self.shutdown.subscribe(),
        ));
        tokio::spawn(Self::sweep_loop(self.waiters.clone(), self.shutdown.subscribe()));

        info!("DHT network listening on {}", self.local_addr);
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
        lock(&self.waiters).clear();
        debug!("DHT network on {} stopped", self.local_addr);
    }

    /// Sends `message` with a fresh id and waits up to `wait` for the reply.
    pub async fn send_request(
        &self,
        target_addr: SocketAddr,
        mut message: DhtMessage,
        wait: Duration,
    ) -> Result<DhtMessage, KademliaError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        message.set_message_id(id);
        let bytes = encode(&message)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(id, (tx, RequestContext::new(target_addr, wait)));

        if let Err(e) = self.socket.send_to(&bytes, target_addr).await {
            lock(&self.waiters).remove(&id);
            return Err(KademliaError::OperationFailed(format!("send to {}: {}", target_addr, e)));
        }

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(KademliaError::OperationFailed("network stopped".to_string())),
            Err(_) => {
                lock(&self.waiters).remove(&id);
                Err(KademliaError::Timeout(format!("no reply from {} for request {}", target_addr, id)))
            }
        }
    }

    /// 发送响应，不等待回复
    pub async fn send_response(&self, target_addr: SocketAddr, message: DhtMessage) -> Result<(), KademliaError> {
        let bytes = encode(&message)?;
        self.socket
            .send_to(&bytes, target_addr)
            .await
            .map_err(|e| KademliaError::OperationFailed(format!("reply to {}: {}", target_addr, e)))?;
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn receive_loop(
        socket: Arc<UdpSocket>,
        waiters: Arc<Mutex<Waiters>>,
        inbound: mpsc::Sender<MessageRoute>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("UDP receive failed: {}", e);
                        continue;
                    }
                },
            };

            let message = match DhtMessage::from_bytes(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    debug!("Ignoring undecodable datagram from {}: {}", from, e);
                    continue;
                }
            };

            if message.is_response() {
                let waiter = lock(&waiters).remove(&message.message_id());
                match waiter {
                    Some((tx, _)) => {
                        let _ = tx.send(message);
                    }
                    None => debug!("Late or unknown response {} from {}", message.message_id(), from),
                }
                continue;
            }

            if inbound.send(MessageRoute { from, message }).await.is_err() {
                warn!("Inbound queue closed, stopping receive loop");
                break;
            }
        }
    }

    async fn sweep_loop(waiters: Arc<Mutex<Waiters>>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let mut waiting = lock(&waiters);
            let before = waiting.len();
            waiting.retain(|_, (_, context)| !context.is_expired());
            if waiting.len() < before {
                debug!("Dropped {} expired requests", before - waiting.len());
            }
        }
    }
}
