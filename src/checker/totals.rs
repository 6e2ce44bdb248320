//! Bulk scanning over CSVs of domains, with aggregated statistics.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::checker::domain::DomainResult;
use crate::checker::result::Status;
use crate::checker::Checker;
use crate::config::{CSV_FEED_INTERVAL, POOL_SIZE, PROGRESS_LOG_INTERVAL};

/// Consumes domain results from the bulk scanner.
///
/// Handlers run on a single consumer task, so implementations need not be
/// thread-safe. They could print results, aggregate them, write them to the
/// database, and so on.
pub trait ResultHandler {
    /// Processes the result of one domain scan.
    fn handle_domain(&mut self, result: DomainResult);
}

/// Aggregated statistics across one bulk sweep. Implements [`ResultHandler`].
#[derive(Debug, Clone)]
pub struct DomainTotals {
    /// When the sweep started.
    pub time: DateTime<Utc>,
    /// Label of the input that fed the sweep.
    pub source: String,
    /// Domains scanned.
    pub attempted: i64,
    /// Domains where at least one MX was usable.
    pub with_mxs: i64,
    /// Domains advertising MTA-STS in testing mode.
    pub mta_sts_testing: Vec<String>,
    /// Domains advertising MTA-STS in enforce mode.
    pub mta_sts_enforce: Vec<String>,
}

impl DomainTotals {
    /// Empty totals stamped with the current time.
    pub fn new(source: &str) -> Self {
        DomainTotals {
            time: Utc::now(),
            source: source.to_string(),
            attempted: 0,
            with_mxs: 0,
            mta_sts_testing: Vec::new(),
            mta_sts_enforce: Vec::new(),
        }
    }
}

impl ResultHandler for DomainTotals {
    fn handle_domain(&mut self, result: DomainResult) {
        self.attempted += 1;
        if self.attempted % PROGRESS_LOG_INTERVAL == 0 {
            info!(
                "{}: scanned {} domains, {} with working MXs, {} testing, {} enforce",
                self.source,
                self.attempted,
                self.with_mxs,
                self.mta_sts_testing.len(),
                self.mta_sts_enforce.len()
            );
        }
        // Worse than a warning means no MX accepted mail from us.
        if result.status > Status::Warning {
            return;
        }
        self.with_mxs += 1;
        if let Some(sts) = &result.mta_sts_result {
            match sts.mode.as_str() {
                "enforce" => self.mta_sts_enforce.push(result.domain),
                "testing" => self.mta_sts_testing.push(result.domain),
                _ => {}
            }
        }
    }
}

/// One persisted row of sweep statistics, keyed by `(time, source)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedScan {
    /// When the sweep started.
    pub time: DateTime<Utc>,
    /// Label of the input that fed the sweep.
    pub source: String,
    /// Domains scanned.
    #[serde(default)]
    pub attempted: i64,
    /// Domains where at least one MX was usable.
    #[serde(default)]
    pub with_mxs: i64,
    /// Count of domains in MTA-STS testing mode.
    #[serde(default)]
    pub mta_sts_testing: i64,
    /// Count of domains in MTA-STS enforce mode.
    #[serde(default)]
    pub mta_sts_enforce: i64,
}

impl AggregatedScan {
    /// MTA-STS adoption as a percentage of domains with working MXs.
    pub fn percent_mta_sts(&self) -> f64 {
        if self.with_mxs == 0 {
            return 0.0;
        }
        100.0 * (self.total_mta_sts() as f64) / (self.with_mxs as f64)
    }

    /// Domains advertising MTA-STS in either mode.
    pub fn total_mta_sts(&self) -> i64 {
        self.mta_sts_testing + self.mta_sts_enforce
    }
}

impl From<&DomainTotals> for AggregatedScan {
    fn from(totals: &DomainTotals) -> Self {
        AggregatedScan {
            time: totals.time,
            source: totals.source.clone(),
            attempted: totals.attempted,
            with_mxs: totals.with_mxs,
            mta_sts_testing: totals.mta_sts_testing.len() as i64,
            mta_sts_enforce: totals.mta_sts_enforce.len() as i64,
        }
    }
}

impl Checker {
    /// Scans every domain in `reader`, handing results to `handler`.
    ///
    /// A blocking producer feeds rows to a fixed pool of [`POOL_SIZE`]
    /// workers through a rendezvous channel; results funnel back to the
    /// calling task, so `handler` is always invoked sequentially.
    /// `domain_column` selects the 0-based CSV column holding the domain.
    pub async fn check_csv<R>(
        &self,
        mut reader: csv::Reader<R>,
        handler: &mut dyn ResultHandler,
        domain_column: usize,
    ) where
        R: std::io::Read + Send + 'static,
    {
        let (work_tx, work_rx) = mpsc::channel::<String>(1);
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));

        let producer = tokio::task::spawn_blocking(move || {
            for record in reader.records() {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("skipping unreadable CSV row: {e}");
                        continue;
                    }
                };
                let Some(domain) = record.get(domain_column) else {
                    continue;
                };
                let domain = domain.trim().to_string();
                if domain.is_empty() {
                    continue;
                }
                if work_tx.blocking_send(domain).is_err() {
                    break;
                }
                std::thread::sleep(CSV_FEED_INTERVAL);
            }
        });

        let (result_tx, mut result_rx) = mpsc::channel::<DomainResult>(1);
        let mut workers = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let checker = self.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let domain = { work_rx.lock().await.recv().await };
                    let Some(domain) = domain else { break };
                    let result = checker.check_domain(&domain, None).await;
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        // Workers hold the only remaining senders; the results channel
        // closes when the last of them finishes.
        drop(result_tx);

        while let Some(result) = result_rx.recv().await {
            handler.handle_domain(result);
        }

        if let Err(e) = producer.await {
            warn!("CSV producer failed: {e}");
        }
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("scan worker failed: {e}");
            }
        }
    }
}
