use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dht_relay::crypto::KeyPair;
use dht_relay::dht::{DhtNode, RecordTransport};
use dht_relay::record::Record;
use dht_relay::service::{Lookup, RecordService};
use dht_relay::storage::{RecordStore, SledStore};
use dht_relay::utils::{format_bytes, parse_log_level, setup_logger, version, Config};
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// 日志级别
    #[clap(long)]
    log_level: Option<String>,

    /// 引导节点 (host:port)，可重复
    #[clap(short, long)]
    bootstrap: Vec<String>,

    /// 数据目录
    #[clap(long)]
    data_dir: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动节点、记录服务和定时重发布
    Run {
        /// 监听地址
        #[clap(short, long)]
        listen: Option<SocketAddr>,
    },

    /// 用十六进制种子签名并发布一个值
    Publish {
        /// 32字节ed25519种子（十六进制）
        #[clap(long)]
        seed: String,

        value: String,

        /// 序列号，默认为当前Unix时间
        #[clap(long)]
        seq: Option<i64>,
    },

    /// 解析记录ID
    Get { id: String },
}

struct Runtime {
    node: DhtNode,
    store: Arc<SledStore>,
    service: RecordService,
}

async fn start(config: &Config, listen: SocketAddr) -> Result<Runtime> {
    config.ensure_data_dir()?;
    let store = Arc::new(SledStore::open(config.database_path()).context("failed to open record store")?);
    info!("Record store opened with {} record(s)", store.record_count().await?);

    let node = DhtNode::bind(listen, config.dht_config()).await?;
    let known = node.bootstrap(&config.dht.bootstrap_peers).await;
    if known == 0 {
        warn!("Routing table is empty, lookups will fall back to local storage");
    }

    let transport: Arc<dyn RecordTransport> = Arc::new(node.client());
    let service = RecordService::new(store.clone(), transport, config.service_config());
    Ok(Runtime { node, store, service })
}

async fn stop(runtime: Runtime) -> Result<()> {
    runtime.service.close().await?;
    runtime.node.close();
    Ok(())
}

/// 等待后台put完成
async fn wait_for_put(service: &RecordService, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let stats = service.stats().publish;
        if stats.puts_succeeded > 0 {
            return true;
        }
        if stats.puts_failed > 0 {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    // 首次运行时保存默认配置
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            eprintln!("Failed to save default config to {}: {}", config_path.display(), e);
        }
    }

    config.apply_env();
    if !args.bootstrap.is_empty() {
        config.dht.bootstrap_peers = args.bootstrap.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    let level = parse_log_level(&config.log_level).map_err(|e| anyhow!(e))?;
    setup_logger(Some(level));
    info!("dht_relay {}", version());

    match args.command {
        Command::Run { listen } => {
            let listen = match listen {
                Some(addr) => addr,
                None => config.listen_addr()?,
            };
            let runtime = start(&config, listen).await?;
            runtime.service.start_republisher()?;
            info!(
                "Serving records, republishing on '{}' (cache limit {})",
                config.republish.cron,
                format_bytes(config.service_config().cache_size_bytes)
            );

            tokio::signal::ctrl_c().await?;
            info!("Shutting down...");

            if let Some(report) = runtime.service.stats().last_republish {
                info!("Last republish: {} of {} record(s) succeeded", report.succeeded, report.seen);
            }
            let failed = runtime.store.failed_record_count().await?;
            if failed > 0 {
                warn!("{} record(s) in the failed-record ledger", failed);
            }
            stop(runtime).await?;
        }

        Command::Publish { seed, value, seq } => {
            let keypair = KeyPair::from_hex_seed(&seed)?;
            let seq = seq.unwrap_or_else(|| chrono::Utc::now().timestamp());
            let record = Record::sign(&keypair, value.as_bytes(), seq)?;
            let id = record.id();

            let runtime = start(&config, "0.0.0.0:0".parse()?).await?;
            runtime.service.publish(&id, &record).await?;
            println!("{}", id);

            let put_timeout = config.service_config().put_timeout + Duration::from_secs(1);
            if wait_for_put(&runtime.service, put_timeout).await {
                info!("Record {} announced to the DHT", id);
            } else {
                warn!("Record {} is stored locally but was not announced; it will be republished", id);
            }
            stop(runtime).await?;
        }

        Command::Get { id } => {
            let runtime = start(&config, "0.0.0.0:0".parse()?).await?;
            let lookup = runtime.service.get(&id).await;
            stop(runtime).await?;

            match lookup? {
                Lookup::Found(response) => {
                    println!("seq: {}", response.sequence);
                    match std::str::from_utf8(&response.value) {
                        Ok(text) => println!("value: {}", text),
                        Err(_) => println!("value (hex): {}", hex::encode(&response.value)),
                    }
                    println!("signature: {}", hex::encode(response.signature));
                }
                Lookup::NotFound => {
                    println!("{} not found", id);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
