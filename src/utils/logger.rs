use env_logger::{Builder, Env};
use log::LevelFilter;

/// 设置日志记录器，`RUST_LOG` 优先于 `level`
pub fn setup_logger(level: Option<LevelFilter>) {
    let env = Env::default().default_filter_or(level_to_str(level.unwrap_or(LevelFilter::Info)));

    let mut builder = Builder::from_env(env);
    builder.format_timestamp_millis();

    // 测试或重复初始化时忽略错误
    let _ = builder.try_init();
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// 从字符串解析日志级别
pub fn parse_log_level(level_str: &str) -> Result<LevelFilter, String> {
    match level_str.trim().to_lowercase().as_str() {
        "off" => Ok(LevelFilter::Off),
        "error" => Ok(LevelFilter::Error),
        "warn" | "warning" => Ok(LevelFilter::Warn),
        "info" => Ok(LevelFilter::Info),
        "debug" => Ok(LevelFilter::Debug),
        "trace" => Ok(LevelFilter::Trace),
        _ => Err(format!("Invalid log level: {}", level_str)),
    }
}
