use crate::dht::RecordTransport;
use crate::record::{FailedRecord, Record};
use crate::storage::RecordStore;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Republish run settings
#[derive(Debug, Clone)]
pub struct RepublishConfig {
    /// Records per page, and the concurrency bound for a batch
    pub batch_size: usize,
    /// Total put attempts per record in one run
    pub max_attempts: u32,
    /// Timeout for each put attempt
    pub put_timeout: Duration,
}

impl Default for RepublishConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_attempts: 3,
            put_timeout: Duration::from_secs(10),
        }
    }
}

/// 单次重发布的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepublishReport {
    /// Store size at the start of the run
    pub record_count: usize,
    pub batches: usize,
    pub seen: usize,
    pub succeeded: usize,
    /// Records that exhausted their attempts
    pub failed: usize,
}

impl RepublishReport {
    pub fn success_rate(&self) -> f64 {
        if self.seen == 0 {
            return 100.0;
        }
        self.succeeded as f64 / self.seen as f64 * 100.0
    }
}

async fn put_once(transport: &Arc<dyn RecordTransport>, record: &Record, put_timeout: Duration) -> bool {
    match tokio::time::timeout(put_timeout, transport.put(record, put_timeout)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("failed to republish record<{}>: {}", record.id(), e);
            false
        }
        Err(_) => {
            debug!("republish of record<{}> timed out", record.id());
            false
        }
    }
}

/// Re-announces every stored record. Pages through the store, puts each
/// batch concurrently, then retries failures one at a time. Records that
/// still fail go to the failed-record ledger.
pub async fn republish_all(
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn RecordTransport>,
    config: RepublishConfig,
) -> RepublishReport {
    let mut report = RepublishReport::default();
    let batch_size = config.batch_size.max(1);

    report.record_count = match store.record_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!("failed to read record count: {}", e);
            0
        }
    };
    info!("Republishing {} record(s)", report.record_count);

    let mut failures: Vec<(Record, FailedRecord)> = Vec::new();
    let mut token: Option<String> = None;

    loop {
        let (records, next) = match store.list_records(token.as_deref(), batch_size).await {
            Ok(page) => page,
            Err(e) => {
                error!("failed to list records for republishing: {}", e);
                break;
            }
        };

        if !records.is_empty() {
            report.batches += 1;
            report.seen += records.len();

            let mut tasks = JoinSet::new();
            for record in records {
                let transport = transport.clone();
                let put_timeout = config.put_timeout;
                tasks.spawn(async move {
                    let ok = put_once(&transport, &record, put_timeout).await;
                    (record, ok)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, true)) => report.succeeded += 1,
                    Ok((record, false)) => {
                        let failed = FailedRecord { id: record.id(), failure_count: 1 };
                        failures.push((record, failed));
                    }
                    Err(e) => {
                        error!("republish task failed: {}", e);
                        report.failed += 1;
                    }
                }
            }

            debug!("Batch {} done, {} failure(s) so far", report.batches, failures.len());
        }

        match next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    if !failures.is_empty() {
        info!("Retrying {} failed record(s)", failures.len());
    }

    for (record, mut failed) in failures {
        let mut recovered = false;
        while failed.failure_count < config.max_attempts {
            if put_once(&transport, &record, config.put_timeout).await {
                recovered = true;
                break;
            }
            failed.failure_count += 1;
        }

        if recovered {
            report.succeeded += 1;
            continue;
        }

        report.failed += 1;
        warn!("record<{}> failed {} republish attempts", failed.id, failed.failure_count);
        if let Err(e) = store.write_failed_record(&failed).await {
            error!("failed to write failed record<{}>: {}", failed.id, e);
        }
    }

    info!(
        "Republishing complete: {} batch(es), {} of {} record(s) succeeded ({:.2}%), {} failed",
        report.batches,
        report.succeeded,
        report.seen,
        report.success_rate(),
        report.failed
    );

    report
}
