mod republish;
mod scheduler;

pub use republish::{republish_all, RepublishConfig, RepublishReport};
pub use scheduler::{parse_cron, Scheduler, SchedulerError, SchedulerState};

use crate::cache::{CacheError, NegativeCache, ResponseCache, TtlCache};
use crate::dht::RecordTransport;
use crate::record::{zbase32, Record, RecordError, Response};
use crate::storage::{RecordStore, StoreError};
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid record: {0}")]
    Record(#[from] RecordError),

    #[error("Rate limited: {0} was not found recently")]
    RateLimited(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Outcome of a successful lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Response),
    NotFound,
}

/// 服务配置
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub cache_ttl: Duration,
    pub cache_size_bytes: usize,
    pub negative_cache_ttl: Duration,
    /// Timeout for the detached put after a publish or a storage repair
    pub put_timeout: Duration,
    /// Timeout for the DHT lookup inside a get
    pub get_timeout: Duration,
    /// Timeout for each storage call
    pub store_timeout: Duration,
    pub republish_cron: String,
    pub republish: RepublishConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(10 * 60),
            cache_size_bytes: 500 * 1024 * 1024,
            negative_cache_ttl: Duration::from_secs(30),
            put_timeout: Duration::from_secs(10),
            get_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
            republish_cron: "0 */3 * * *".to_string(),
            republish: RepublishConfig::default(),
        }
    }
}

/// 异步put的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishStats {
    pub puts_succeeded: u64,
    pub puts_failed: u64,
}

#[derive(Default)]
struct Counters {
    puts_succeeded: AtomicU64,
    puts_failed: AtomicU64,
}

/// Service-wide statistics
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub publish: PublishStats,
    pub last_republish: Option<RepublishReport>,
}

type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Largest cached entry: id plus a full wire record
const MAX_CACHE_ENTRY: usize = 2048;
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
/// 负缓存容量下限，保证小缓存配置下限流仍然有效
const MIN_NEGATIVE_CACHE_BYTES: usize = 64 * 1024;

/// Publishes and resolves records across the caches, the durable store and
/// the DHT, and owns the republish scheduler.
#[derive(Clone)]
pub struct RecordService {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn RecordTransport>,
    responses: ResponseCache,
    negative: NegativeCache,
    scheduler: Arc<Scheduler>,
    config: ServiceConfig,
    counters: Arc<Counters>,
    last_report: Arc<Mutex<Option<RepublishReport>>>,
    janitors: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RecordService {
    /// Builds the service with TTL caches sized from `config`. Must be called
    /// inside a tokio runtime.
    pub fn new(store: Arc<dyn RecordStore>, transport: Arc<dyn RecordTransport>, config: ServiceConfig) -> Self {
        let responses = Arc::new(TtlCache::new(config.cache_ttl, config.cache_size_bytes, MAX_CACHE_ENTRY));
        let negative_bytes = (config.cache_size_bytes / 16).max(MIN_NEGATIVE_CACHE_BYTES);
        let negative = Arc::new(TtlCache::new(config.negative_cache_ttl, negative_bytes, MAX_CACHE_ENTRY));
        let janitors = vec![
            responses.spawn_janitor(JANITOR_INTERVAL),
            negative.spawn_janitor(JANITOR_INTERVAL),
        ];

        let service = Self::with_caches(
            store,
            transport,
            ResponseCache::new(responses),
            NegativeCache::new(negative),
            config,
        );
        service.janitors.lock().unwrap_or_else(PoisonError::into_inner).extend(janitors);
        service
    }

    /// Builds the service around caller-supplied caches.
    pub fn with_caches(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn RecordTransport>,
        responses: ResponseCache,
        negative: NegativeCache,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            transport,
            responses,
            negative,
            scheduler: Arc::new(Scheduler::new()),
            config,
            counters: Arc::new(Counters::default()),
            last_report: Arc::new(Mutex::new(None)),
            janitors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable("storage call timed out".to_string())),
        }
    }

    /// 解析ID，返回公钥和规范形式的ID；缓存与存储一律以规范ID为键
    fn validate_id(id: &str) -> Result<([u8; 32], String), ServiceError> {
        let key = zbase32::decode_id(id).map_err(|e| ServiceError::InvalidId(e.to_string()))?;
        Ok((key, zbase32::encode(&key)))
    }

    /// Validates and durably stores `record`, then pushes it to the DHT in
    /// the background. Success means the record is durable locally.
    pub async fn publish(&self, id: &str, record: &Record) -> Result<(), ServiceError> {
        let (key, canonical) = Self::validate_id(id)?;
        let id = canonical.as_str();
        if key != record.key {
            return Err(ServiceError::InvalidId(format!("{} does not match the record key", id)));
        }
        record.is_valid()?;

        let response = record.response();
        match self.responses.get(id) {
            Ok(Some(cached)) if cached == response => {
                debug!("record<{}> already published, skipping", id);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("dropping corrupt cache entry for record<{}>: {}", id, e),
        }

        self.bounded(self.store.write_record(record)).await?;
        if let Err(e) = self.responses.set(id, &response) {
            warn!("failed to cache record<{}>: {}", id, e);
        }
        self.negative.clear(id);

        self.spawn_put(record.clone());
        info!("published record<{}> seq {}", id, record.sequence);
        Ok(())
    }

    /// Resolves `id` through the caches, the DHT and then storage.
    pub async fn get(&self, id: &str) -> Result<Lookup, ServiceError> {
        let (_, canonical) = Self::validate_id(id)?;
        let id = canonical.as_str();

        if self.negative.contains(id) {
            return Err(ServiceError::RateLimited(id.to_string()));
        }

        match self.responses.get(id) {
            Ok(Some(response)) => {
                debug!("resolved record<{}> from cache", id);
                return Ok(Lookup::Found(response));
            }
            Ok(None) => {}
            Err(e) => warn!("dropping corrupt cache entry for record<{}>: {}", id, e),
        }

        let timeout = self.config.get_timeout;
        let lookup = tokio::time::timeout(timeout, self.transport.get_full(id, timeout)).await;
        match lookup {
            Ok(Ok(full)) if full.mutable => {
                let response = Response {
                    value: full.value,
                    sequence: full.seq,
                    signature: full.signature,
                };
                if let Err(e) = self.responses.set(id, &response) {
                    warn!("failed to cache record<{}>: {}", id, e);
                }
                debug!("resolved record<{}> from dht", id);
                return Ok(Lookup::Found(response));
            }
            Ok(Ok(_)) => warn!("dht returned an immutable item for record<{}>, attempting storage", id),
            Ok(Err(e)) => warn!("failed to get record<{}> from dht, attempting storage: {}", id, e),
            Err(_) => warn!("dht lookup for record<{}> timed out, attempting storage", id),
        }

        match self.bounded(self.store.read_record(id)).await? {
            Some(record) => {
                let response = record.response();
                if let Err(e) = self.responses.set(id, &response) {
                    warn!("failed to cache record<{}>: {}", id, e);
                }
                debug!("resolved record<{}> from storage, republishing", id);
                self.spawn_put(record);
                Ok(Lookup::Found(response))
            }
            None => {
                if let Err(e) = self.negative.mark(id) {
                    warn!("failed to mark record<{}> as missing: {}", id, e);
                }
                debug!("record<{}> not found", id);
                Ok(Lookup::NotFound)
            }
        }
    }

    fn spawn_put(&self, record: Record) {
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let put_timeout = self.config.put_timeout;

        tokio::spawn(async move {
            let id = record.id();
            match tokio::time::timeout(put_timeout, transport.put(&record, put_timeout)).await {
                Ok(Ok(_)) => {
                    counters.puts_succeeded.fetch_add(1, Ordering::SeqCst);
                    debug!("put record<{}> to dht", id);
                }
                Ok(Err(e)) => {
                    counters.puts_failed.fetch_add(1, Ordering::SeqCst);
                    warn!("failed to put record<{}> to dht: {}", id, e);
                }
                Err(_) => {
                    counters.puts_failed.fetch_add(1, Ordering::SeqCst);
                    warn!("put of record<{}> to dht timed out", id);
                }
            }
        });
    }

    fn republish_job(&self) -> impl Fn() -> JobFuture + Send + Sync + 'static {
        let store = self.store.clone();
        let transport = self.transport.clone();
        let config = self.config.republish.clone();
        let last_report = self.last_report.clone();

        move || -> JobFuture {
            let store = store.clone();
            let transport = transport.clone();
            let config = config.clone();
            let last_report = last_report.clone();
            Box::pin(async move {
                let report = republish_all(store, transport, config).await;
                *last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
            })
        }
    }

    /// Runs a republish now, unless one is already in progress.
    pub async fn republish(&self) -> Result<RepublishReport, ServiceError> {
        let run = republish_all(self.store.clone(), self.transport.clone(), self.config.republish.clone());
        let report = self.scheduler.run_once(run).await?;
        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        Ok(report)
    }

    /// Starts periodic republishing on the configured cron expression.
    pub fn start_republisher(&self) -> Result<(), ServiceError> {
        self.scheduler.schedule(&self.config.republish_cron, self.republish_job())?;
        Ok(())
    }

    /// Periodic republishing at a fixed period instead of cron.
    pub fn start_republisher_every(&self, period: Duration) -> Result<(), ServiceError> {
        self.scheduler.schedule_interval(period, self.republish_job())?;
        Ok(())
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            publish: PublishStats {
                puts_succeeded: self.counters.puts_succeeded.load(Ordering::SeqCst),
                puts_failed: self.counters.puts_failed.load(Ordering::SeqCst),
            },
            last_republish: self.last_report.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }

    /// Stops the scheduler (waiting for an in-flight run) and closes the store.
    pub async fn close(&self) -> Result<(), ServiceError> {
        self.scheduler.stop().await;
        for janitor in self.janitors.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            janitor.abort();
        }
        self.store.close().await?;
        info!("record service closed");
        Ok(())
    }
}
