mod config;
mod logger;

pub use config::{CacheSection, Config, ConfigError, DhtSection, RepublishSection, StorageSection, BOOTSTRAP_PEERS_ENV};
pub use logger::{parse_log_level, setup_logger};

/// 获取应用程序版本
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 格式化字节大小为可读字符串
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes = bytes as f64;
    let base = 1024_f64;

    let exponent = (bytes.ln() / base.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);

    let value = bytes / base.powi(exponent as i32);

    format!("{:.2} {}", value, UNITS[exponent])
}
