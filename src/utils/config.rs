use crate::dht::{default_bootstrap_peers, DhtConfig};
use crate::service::{RepublishConfig, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// 覆盖引导节点的环境变量
pub const BOOTSTRAP_PEERS_ENV: &str = "BOOTSTRAP_PEERS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// DHT节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    /// 监听地址
    pub listen_addr: String,

    /// 引导节点 (host:port)
    pub bootstrap_peers: Vec<String>,

    pub k: usize,

    pub alpha: usize,

    /// 单次查询超时（毫秒）
    pub query_timeout_ms: u64,
}

impl Default for DhtSection {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            listen_addr: "0.0.0.0:6881".to_string(),
            bootstrap_peers: default_bootstrap_peers(),
            k: dht.k,
            alpha: dht.alpha,
            query_timeout_ms: dht.query_timeout.as_millis() as u64,
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub ttl_secs: u64,

    /// 缓存大小上限（MB）
    pub size_limit_mb: usize,

    pub negative_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            size_limit_mb: 500,
            negative_ttl_secs: 30,
        }
    }
}

/// 重发布配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepublishSection {
    /// cron表达式（UTC）
    pub cron: String,

    pub batch_size: usize,

    pub max_attempts: u32,

    pub put_timeout_secs: u64,
}

impl Default for RepublishSection {
    fn default() -> Self {
        Self {
            cron: "0 */3 * * *".to_string(),
            batch_size: 1000,
            max_attempts: 3,
            put_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// 数据目录
    pub data_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dht: DhtSection,

    pub cache: CacheSection,

    pub republish: RepublishSection,

    pub storage: StorageSection,

    /// 日志级别
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dht: DhtSection::default(),
            cache: CacheSection::default(),
            republish: RepublishSection::default(),
            storage: StorageSection::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Default location: `<config_dir>/dht_relay/config.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dht_relay")
            .join("config.json")
    }

    /// 从文件加载配置，文件不存在时使用默认值
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(path)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 保存配置到文件
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(content.as_bytes())?;

        Ok(())
    }

    /// Applies `BOOTSTRAP_PEERS` from the environment, if set.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(BOOTSTRAP_PEERS_ENV) {
            self.apply_bootstrap_override(&value);
        }
    }

    /// 逗号分隔的引导节点列表，空列表不覆盖
    pub fn apply_bootstrap_override(&mut self, value: &str) {
        let peers: Vec<String> = value
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if !peers.is_empty() {
            self.dht.bootstrap_peers = peers;
        }
    }

    pub fn ensure_data_dir(&self) -> Result<(), ConfigError> {
        create_dir_all(&self.storage.data_dir)?;
        Ok(())
    }

    /// sled数据库路径
    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join("records.db")
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.dht.listen_addr.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
            field: "dht.listen_addr",
            reason: e.to_string(),
        })
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.dht.k.max(1),
            alpha: self.dht.alpha.max(1),
            query_timeout: Duration::from_millis(self.dht.query_timeout_ms),
            ..DhtConfig::default()
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        let put_timeout = Duration::from_secs(self.republish.put_timeout_secs);
        ServiceConfig {
            cache_ttl: Duration::from_secs(self.cache.ttl_secs),
            cache_size_bytes: self.cache.size_limit_mb.saturating_mul(1024 * 1024),
            negative_cache_ttl: Duration::from_secs(self.cache.negative_ttl_secs),
            put_timeout,
            republish_cron: self.republish.cron.clone(),
            republish: RepublishConfig {
                batch_size: self.republish.batch_size.max(1),
                max_attempts: self.republish.max_attempts.max(1),
                put_timeout,
            },
            ..ServiceConfig::default()
        }
    }
}
