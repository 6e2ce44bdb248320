//! MTA-STS adoption statistics.
//!
//! Sweeps of the web's top domains run elsewhere and publish their
//! aggregates; we import those alongside our own rollups and serve both as
//! time series for the frontend charts.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::checker::AggregatedScan;
use crate::error_handling::DatabaseError;
use crate::storage::StatsStore;

/// Source label for aggregates imported from the top-domains scanner.
pub const TOP_DOMAINS_SOURCE: &str = "TOP_DOMAINS";

/// Source label for our own rollups of user-initiated scans.
pub const LOCAL_SOURCE: &str = "local";

/// Environment variable naming the remote aggregated-stats endpoint.
pub const REMOTE_STATS_URL_ENV: &str = "REMOTE_STATS_URL";

/// A statistic as it changes over time, keyed by sweep time.
#[derive(Debug, Clone, Default)]
pub struct Series(BTreeMap<DateTime<Utc>, AggregatedScan>);

impl Series {
    /// Adds one aggregated sweep to the series.
    pub fn insert(&mut self, scan: AggregatedScan) {
        self.0.insert(scan.time, scan);
    }

    /// Number of points in the series.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the series has no points.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates points in chronological order.
    pub fn iter(&self) -> impl Iterator<Item = &AggregatedScan> {
        self.0.values()
    }
}

// Serialized in the x/y shape the frontend charting library expects, newest
// first. User-initiated sources chart a percentage; the top-domains source
// has too few MTA-STS domains for a percentage to read well, so it charts
// the raw total.
impl Serialize for Series {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct XyPoint {
            x: DateTime<Utc>,
            y: f64,
        }
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for scan in self.0.values().rev() {
            let y = if scan.source != TOP_DOMAINS_SOURCE {
                scan.percent_mta_sts()
            } else {
                scan.total_mta_sts() as f64
            };
            seq.serialize_element(&XyPoint { x: scan.time, y })?;
        }
        seq.end()
    }
}

/// Imports aggregated scans published by the top-domains scanner.
///
/// The endpoint serves a JSON array of aggregates; each is restamped with
/// the top-domains source label and stored idempotently.
pub async fn import(
    store: &dyn StatsStore,
    client: &reqwest::Client,
    stats_url: &str,
) -> anyhow::Result<()> {
    let scans: Vec<AggregatedScan> = client
        .get(stats_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    for mut scan in scans {
        scan.source = TOP_DOMAINS_SOURCE.to_string();
        store.put_aggregated_scan(&scan).await?;
    }
    Ok(())
}

/// Spawns a task importing remote stats every `interval`; deployments
/// normally pass [`crate::config::STATS_IMPORT_INTERVAL`].
///
/// Each failure is logged and the next tick tries again.
pub fn spawn_importer(
    store: Arc<dyn StatsStore>,
    client: reqwest::Client,
    stats_url: String,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = import(store.as_ref(), &client, &stats_url).await {
                warn!("stats import from {stats_url} failed: {e}");
            }
        }
    })
}

/// The chart series for user-initiated scans and the top-domain sweeps.
pub async fn get(store: &dyn StatsStore) -> Result<HashMap<String, Series>, DatabaseError> {
    let mut result = HashMap::new();
    result.insert(
        "top_million".to_string(),
        store.get_stats(TOP_DOMAINS_SOURCE).await?,
    );
    result.insert("local".to_string(), store.get_stats(LOCAL_SOURCE).await?);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn scan(source: &str, offset_hours: i64, testing: i64, enforce: i64) -> AggregatedScan {
        AggregatedScan {
            time: Utc::now() - TimeDelta::hours(offset_hours),
            source: source.to_string(),
            attempted: 100,
            with_mxs: 50,
            mta_sts_testing: testing,
            mta_sts_enforce: enforce,
        }
    }

    #[test]
    fn series_serializes_newest_first() {
        let mut series = Series::default();
        series.insert(scan(LOCAL_SOURCE, 2, 5, 5));
        series.insert(scan(LOCAL_SOURCE, 1, 10, 15));

        let json = serde_json::to_value(&series).expect("serialize");
        let points = json.as_array().expect("array");
        assert_eq!(points.len(), 2);
        // Newest point first: 50% adoption (25 of 50).
        assert_eq!(points[0]["y"].as_f64().unwrap(), 50.0);
        assert_eq!(points[1]["y"].as_f64().unwrap(), 20.0);
    }

    #[test]
    fn top_domains_series_charts_raw_totals() {
        let mut series = Series::default();
        series.insert(scan(TOP_DOMAINS_SOURCE, 1, 3, 4));
        let json = serde_json::to_value(&series).expect("serialize");
        assert_eq!(json[0]["y"].as_f64().unwrap(), 7.0);
    }

    #[test]
    fn duplicate_times_collapse() {
        let mut series = Series::default();
        let point = scan(LOCAL_SOURCE, 1, 1, 1);
        series.insert(point.clone());
        series.insert(point);
        assert_eq!(series.len(), 1);
    }
}
