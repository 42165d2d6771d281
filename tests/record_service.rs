use async_trait::async_trait;
use dht_relay::cache::{NegativeCache, ResponseCache, TtlCache};
use dht_relay::crypto::KeyPair;
use dht_relay::dht::{DhtConfig, MemoryNetwork, RecordTransport};
use dht_relay::record::{zbase32, FailedRecord, Record, RecordError};
use dht_relay::service::{Lookup, RecordService, SchedulerError, ServiceConfig, ServiceError};
use dht_relay::storage::{MemoryStore, RecordStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> ServiceConfig {
    ServiceConfig {
        put_timeout: Duration::from_secs(2),
        get_timeout: Duration::from_secs(2),
        ..ServiceConfig::default()
    }
}

async fn setup() -> (Arc<MemoryNetwork>, Arc<MemoryStore>, RecordService) {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(8).await;
    let store = Arc::new(MemoryStore::new());
    let transport: Arc<dyn RecordTransport> = Arc::new(network.client().await);
    let service = RecordService::new(store.clone(), transport, test_config());
    (network, store, service)
}

/// 等待后台put结束
async fn settle_puts(service: &RecordService, expected: u64) {
    for _ in 0..100 {
        let stats = service.stats().publish;
        if stats.puts_succeeded + stats.puts_failed >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("background puts did not finish");
}

fn unknown_id() -> String {
    let kp = KeyPair::generate().unwrap();
    zbase32::encode(&kp.public.to_bytes())
}

#[tokio::test]
async fn test_publish_then_get() {
    let (network, store, service) = setup().await;
    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"v=1", 1).unwrap();
    let id = record.id();

    service.publish(&id, &record).await.unwrap();
    assert_eq!(store.read_record(&id).await.unwrap(), Some(record.clone()));

    let found = service.get(&id).await.unwrap();
    assert_eq!(found, Lookup::Found(record.response()));

    settle_puts(&service, 1).await;
    assert_eq!(service.stats().publish.puts_succeeded, 1);
    assert!(network.holders(&record.put().target()).await >= 1);
}

#[tokio::test]
async fn test_publish_rejects_invalid_records() {
    let (_network, store, service) = setup().await;
    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"payload", 3).unwrap();

    // 格式错误的ID
    assert!(matches!(service.publish("0000", &record).await, Err(ServiceError::InvalidId(_))));

    // ID与记录公钥不符
    let other = unknown_id();
    assert!(matches!(service.publish(&other, &record).await, Err(ServiceError::InvalidId(_))));

    // 篡改值后签名失效
    let mut tampered = record.clone();
    tampered.value = b"payloaD".to_vec();
    assert!(matches!(
        service.publish(&record.id(), &tampered).await,
        Err(ServiceError::Record(RecordError::InvalidSignature))
    ));

    let mut bumped = record.clone();
    bumped.sequence = 4;
    assert!(matches!(
        service.publish(&record.id(), &bumped).await,
        Err(ServiceError::Record(RecordError::InvalidSignature))
    ));

    assert_eq!(store.record_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_republishing_same_record_is_idempotent() {
    let (_network, store, service) = setup().await;
    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"same", 5).unwrap();
    let id = record.id();

    service.publish(&id, &record).await.unwrap();
    service.publish(&id, &record).await.unwrap();
    service.publish(&id, &record).await.unwrap();

    assert_eq!(store.write_count(), 1);
    settle_puts(&service, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = service.stats().publish;
    assert_eq!(stats.puts_succeeded + stats.puts_failed, 1);
}

#[tokio::test]
async fn test_sequence_arbitration() {
    let (_network, store, service) = setup().await;
    let kp = KeyPair::generate().unwrap();
    let first = Record::sign(&kp, b"first", 10).unwrap();
    let newer = Record::sign(&kp, b"newer", 11).unwrap();
    let older = Record::sign(&kp, b"older", 9).unwrap();
    let id = first.id();

    service.publish(&id, &first).await.unwrap();
    service.publish(&id, &newer).await.unwrap();
    assert_eq!(service.get(&id).await.unwrap(), Lookup::Found(newer.response()));

    let result = service.publish(&id, &older).await;
    assert!(matches!(
        result,
        Err(ServiceError::Store(StoreError::StaleSequence { stored: 11, attempted: 9 }))
    ));
    assert_eq!(store.read_record(&id).await.unwrap(), Some(newer.clone()));
    assert_eq!(service.get(&id).await.unwrap(), Lookup::Found(newer.response()));
}

#[tokio::test]
async fn test_get_resolves_from_dht_for_another_node() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(8).await;

    let publisher = RecordService::new(
        Arc::new(MemoryStore::new()),
        Arc::new(network.client().await),
        test_config(),
    );
    let reader_store = Arc::new(MemoryStore::new());
    let reader = RecordService::new(reader_store.clone(), Arc::new(network.client().await), test_config());

    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"shared", 2).unwrap();
    let id = record.id();
    publisher.publish(&id, &record).await.unwrap();
    settle_puts(&publisher, 1).await;

    assert_eq!(reader.get(&id).await.unwrap(), Lookup::Found(record.response()));
    // 读取方不会持久化别人的记录
    assert_eq!(reader_store.record_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_falls_back_to_storage_when_dht_forgets() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(6).await;
    let store = Arc::new(MemoryStore::new());

    // 极短TTL，使响应缓存很快失效
    let responses = ResponseCache::new(Arc::new(TtlCache::new(Duration::from_millis(30), 1 << 20, 2048)));
    let negative = NegativeCache::new(Arc::new(TtlCache::new(Duration::from_secs(30), 1 << 20, 2048)));
    let service = RecordService::with_caches(
        store.clone(),
        Arc::new(network.client().await),
        responses,
        negative,
        test_config(),
    );

    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"durable", 4).unwrap();
    let id = record.id();
    service.publish(&id, &record).await.unwrap();
    settle_puts(&service, 1).await;

    network.forget_all().await;
    network.set_offline(true);
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(service.get(&id).await.unwrap(), Lookup::Found(record.response()));

    // 从存储读取后会尝试重新发布，离线时失败
    settle_puts(&service, 2).await;
    assert_eq!(service.stats().publish.puts_failed, 1);

    // 重新上线后，修复性发布让记录回到DHT
    network.set_offline(false);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(service.get(&id).await.unwrap(), Lookup::Found(record.response()));
    settle_puts(&service, 3).await;
    assert!(network.holders(&record.put().target()).await >= 1);
}

#[tokio::test]
async fn test_missing_record_is_rate_limited() {
    let (_network, _store, service) = setup().await;
    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"late", 1).unwrap();
    let id = record.id();

    assert_eq!(service.get(&id).await.unwrap(), Lookup::NotFound);
    assert!(matches!(service.get(&id).await, Err(ServiceError::RateLimited(_))));

    // 发布会清除负缓存
    service.publish(&id, &record).await.unwrap();
    assert_eq!(service.get(&id).await.unwrap(), Lookup::Found(record.response()));
}

/// 翻转最后一个字符的填充位，得到解码为同一公钥的另一个ID
fn padding_alias(id: &str) -> String {
    const ALPHABET: &str = "ybndrfg8ejkmcpqxot1uwisza345h769";
    let last = id.chars().last().unwrap();
    let value = ALPHABET.find(last).unwrap();
    let flipped = ALPHABET.chars().nth(value ^ 1).unwrap();
    format!("{}{}", &id[..id.len() - 1], flipped)
}

#[tokio::test]
async fn test_id_aliases_resolve_to_the_same_record() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(4).await;
    let store = Arc::new(MemoryStore::new());
    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"canonical", 1).unwrap();
    store.write_record(&record).await.unwrap();
    network.set_offline(true);

    let service = RecordService::new(store.clone(), Arc::new(network.client().await), test_config());
    let alias = padding_alias(&record.id());
    assert_ne!(alias, record.id());
    assert_eq!(zbase32::decode_id(&alias).unwrap(), record.key);

    assert_eq!(service.get(&alias).await.unwrap(), Lookup::Found(record.response()));
    assert_eq!(
        service.get(&record.id().to_uppercase()).await.unwrap(),
        Lookup::Found(record.response())
    );

    // 发布时使用别名也写入规范ID
    let newer = Record::sign(&kp, b"newer", 2).unwrap();
    service.publish(&alias, &newer).await.unwrap();
    assert_eq!(store.read_record(&record.id()).await.unwrap(), Some(newer));
    assert_eq!(store.record_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rate_limit_covers_id_aliases() {
    let (_network, _store, service) = setup().await;
    let id = unknown_id();

    assert_eq!(service.get(&id).await.unwrap(), Lookup::NotFound);
    assert!(matches!(service.get(&id).await, Err(ServiceError::RateLimited(_))));
    assert!(matches!(service.get(&id.to_uppercase()).await, Err(ServiceError::RateLimited(_))));
    assert!(matches!(service.get(&padding_alias(&id)).await, Err(ServiceError::RateLimited(_))));
}

#[tokio::test]
async fn test_rate_limit_survives_tiny_cache() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(4).await;
    let config = ServiceConfig {
        cache_size_bytes: 8,
        ..test_config()
    };
    let service = RecordService::new(Arc::new(MemoryStore::new()), Arc::new(network.client().await), config);

    let id = unknown_id();
    assert_eq!(service.get(&id).await.unwrap(), Lookup::NotFound);
    assert!(matches!(service.get(&id).await, Err(ServiceError::RateLimited(_))));
}

#[tokio::test]
async fn test_get_rejects_bad_id() {
    let (_network, _store, service) = setup().await;
    assert!(matches!(service.get("").await, Err(ServiceError::InvalidId(_))));
    assert!(matches!(service.get("l0l0").await, Err(ServiceError::InvalidId(_))));
}

/// 读取总是失败的存储
struct BrokenStore;

#[async_trait]
impl RecordStore for BrokenStore {
    async fn write_record(&self, _record: &Record) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk on fire".to_string()))
    }

    async fn read_record(&self, _id: &str) -> Result<Option<Record>, StoreError> {
        Err(StoreError::Unavailable("disk on fire".to_string()))
    }

    async fn list_records(&self, _page_token: Option<&str>, _page_size: usize) -> Result<(Vec<Record>, Option<String>), StoreError> {
        Err(StoreError::Unavailable("disk on fire".to_string()))
    }

    async fn record_count(&self) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("disk on fire".to_string()))
    }

    async fn write_failed_record(&self, _failed: &FailedRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk on fire".to_string()))
    }

    async fn list_failed_records(&self) -> Result<Vec<FailedRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn failed_record_count(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_storage_errors_surface_and_are_not_cached() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(4).await;
    let service = RecordService::new(Arc::new(BrokenStore), Arc::new(network.client().await), test_config());

    let kp = KeyPair::generate().unwrap();
    let record = Record::sign(&kp, b"x", 1).unwrap();
    let id = record.id();

    assert!(matches!(service.publish(&id, &record).await, Err(ServiceError::Store(_))));
    assert_eq!(service.stats().publish, Default::default());

    // 存储错误不会写入负缓存
    assert!(matches!(service.get(&id).await, Err(ServiceError::Store(_))));
    assert!(matches!(service.get(&id).await, Err(ServiceError::Store(_))));

    // 空存储上的重发布只是什么都不做
    let report = service.republish().await.unwrap();
    assert_eq!(report.seen, 0);
}

#[tokio::test]
async fn test_republisher_lifecycle() {
    let (_network, store, service) = setup().await;
    for value in [b"a", b"b", b"c"] {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, value, 1).unwrap();
        store.write_record(&record).await.unwrap();
    }

    service.start_republisher_every(Duration::from_millis(50)).unwrap();
    assert!(matches!(
        service.start_republisher(),
        Err(ServiceError::Scheduler(SchedulerError::AlreadyScheduled))
    ));

    let mut report = None;
    for _ in 0..100 {
        report = service.stats().last_republish;
        if report.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let report = report.expect("scheduled republish did not run");
    assert_eq!(report.seen, 3);
    assert_eq!(report.succeeded, 3);

    service.close().await.unwrap();
    assert!(matches!(
        service.republish().await,
        Err(ServiceError::Scheduler(SchedulerError::Stopped))
    ));
}

#[tokio::test]
async fn test_invalid_cron_is_rejected() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(1).await;
    let config = ServiceConfig {
        republish_cron: "every tuesday".to_string(),
        ..test_config()
    };
    let service = RecordService::new(Arc::new(MemoryStore::new()), Arc::new(network.client().await), config);

    assert!(matches!(
        service.start_republisher(),
        Err(ServiceError::Scheduler(SchedulerError::InvalidCron { .. }))
    ));
}
