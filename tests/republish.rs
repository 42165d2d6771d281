use dht_relay::crypto::KeyPair;
use dht_relay::dht::{DhtConfig, MemoryNetwork, RecordTransport};
use dht_relay::record::Record;
use dht_relay::service::{republish_all, RecordService, RepublishConfig, ServiceConfig};
use dht_relay::storage::{MemoryStore, RecordStore, SledStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn config(batch_size: usize) -> RepublishConfig {
    RepublishConfig {
        batch_size,
        max_attempts: 3,
        put_timeout: Duration::from_secs(2),
    }
}

async fn fill(store: &dyn RecordStore, count: usize) -> Vec<Record> {
    let mut records = Vec::new();
    for i in 0..count {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, format!("value-{}", i).as_bytes(), 1).unwrap();
        store.write_record(&record).await.unwrap();
        records.push(record);
    }
    records
}

/// N条记录中M条失败：失败的记录进入台账，计数为最大尝试次数
#[tokio::test]
async fn test_failures_land_in_ledger() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(8).await;
    let transport: Arc<dyn RecordTransport> = Arc::new(network.client().await);
    let store = Arc::new(MemoryStore::new());

    let records = fill(store.as_ref(), 10).await;
    let failing: HashSet<String> = records.iter().take(3).map(|r| r.id()).collect();
    for record in records.iter().take(3) {
        network.fail_puts_for(record.put().target());
    }

    let report = republish_all(store.clone(), transport.clone(), config(4)).await;
    assert_eq!(report.record_count, 10);
    assert_eq!(report.batches, 3);
    assert_eq!(report.seen, 10);
    assert_eq!(report.succeeded, 7);
    assert_eq!(report.failed, 3);
    assert!((report.success_rate() - 70.0).abs() < 1e-9);

    let ledger = store.list_failed_records().await.unwrap();
    assert_eq!(ledger.len(), 3);
    for entry in &ledger {
        assert!(failing.contains(&entry.id));
        assert_eq!(entry.failure_count, 3);
    }

    for record in records.iter().skip(3) {
        assert!(network.holders(&record.put().target()).await >= 1);
    }

    // 台账跨运行累计
    republish_all(store.clone(), transport, config(4)).await;
    let ledger = store.list_failed_records().await.unwrap();
    assert_eq!(ledger.len(), 3);
    assert!(ledger.iter().all(|e| e.failure_count == 6));
}

#[tokio::test]
async fn test_empty_store() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(2).await;
    let transport: Arc<dyn RecordTransport> = Arc::new(network.client().await);
    let store = Arc::new(MemoryStore::new());

    let report = republish_all(store.clone(), transport, config(100)).await;
    assert_eq!(report.seen, 0);
    assert_eq!(report.batches, 0);
    assert_eq!(report.success_rate(), 100.0);
    assert_eq!(store.failed_record_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_offline_network_fails_everything() {
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(4).await;
    let transport: Arc<dyn RecordTransport> = Arc::new(network.client().await);
    let store = Arc::new(MemoryStore::new());
    fill(store.as_ref(), 5).await;

    network.set_offline(true);
    let report = republish_all(store.clone(), transport, config(2)).await;
    assert_eq!(report.seen, 5);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failed, 5);
    assert_eq!(store.failed_record_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_republish_from_sled_restores_dht() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SledStore::open(dir.path().join("records.db")).unwrap());
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(6).await;

    let records = fill(store.as_ref(), 6).await;
    network.forget_all().await;

    let service = RecordService::new(
        store.clone(),
        Arc::new(network.client().await),
        ServiceConfig {
            republish: config(4),
            ..ServiceConfig::default()
        },
    );
    let report = service.republish().await.unwrap();
    assert_eq!(report.seen, 6);
    assert_eq!(report.succeeded, 6);
    assert_eq!(service.stats().last_republish, Some(report));

    for record in &records {
        assert!(network.holders(&record.put().target()).await >= 1);
    }
    service.close().await.unwrap();
}

/// 损坏的行不会阻塞其后记录的重发布
#[tokio::test]
async fn test_corrupt_row_does_not_stop_the_run() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("records.db");
    {
        let db = sled::open(&path).unwrap();
        db.open_tree("records").unwrap().insert("1", b"garbage".to_vec()).unwrap();
        db.flush().unwrap();
    }

    let store = Arc::new(SledStore::open(&path).unwrap());
    fill(store.as_ref(), 5).await;
    let network = MemoryNetwork::new(DhtConfig::default());
    network.spawn_nodes(6).await;
    let transport: Arc<dyn RecordTransport> = Arc::new(network.client().await);

    let report = republish_all(store.clone(), transport, config(2)).await;
    assert_eq!(report.record_count, 6);
    assert_eq!(report.seen, 5);
    assert_eq!(report.succeeded, 5);
    assert_eq!(report.failed, 0);
}
