//! Metrics registry and Prometheus rendering.
//!
//! One registry holds every counter and gauge the pipeline reports; the
//! `/metrics` endpoint renders a snapshot in Prometheus text format. The
//! registry never blocks writers for long: updates take a short async write
//! lock on the relevant map, rendering takes read locks.

use cassflow_core::Destination;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Shared handle to the registry.
pub type SharedMetrics = Arc<MetricsRegistry>;

/// Counters and gauges for the replication pipeline.
pub struct MetricsRegistry {
    started_at: Instant,
    events_processed: RwLock<HashMap<(Destination, String), u64>>,
    errors: RwLock<HashMap<(Destination, &'static str), u64>>,
    retry_attempts: RwLock<HashMap<Destination, u64>>,
    dlq_events: RwLock<HashMap<(Destination, String), u64>>,
    parse_skips: RwLock<u64>,
    lag_seconds: RwLock<HashMap<Destination, f64>>,
    events_per_second: RwLock<HashMap<Destination, f64>>,
    backlog_depth: RwLock<HashMap<Destination, u64>>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            events_processed: RwLock::new(HashMap::new()),
            errors: RwLock::new(HashMap::new()),
            retry_attempts: RwLock::new(HashMap::new()),
            dlq_events: RwLock::new(HashMap::new()),
            parse_skips: RwLock::new(0),
            lag_seconds: RwLock::new(HashMap::new()),
            events_per_second: RwLock::new(HashMap::new()),
            backlog_depth: RwLock::new(HashMap::new()),
        }
    }
}

impl MetricsRegistry {
    pub fn new() -> SharedMetrics {
        Arc::new(Self::default())
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub async fn record_processed(&self, destination: Destination, table: &str, count: u64) {
        *self
            .events_processed
            .write()
            .await
            .entry((destination, table.to_string()))
            .or_insert(0) += count;
    }

    pub async fn record_error(&self, destination: Destination, code: &'static str) {
        *self
            .errors
            .write()
            .await
            .entry((destination, code))
            .or_insert(0) += 1;
    }

    pub async fn record_retry(&self, destination: Destination) {
        *self
            .retry_attempts
            .write()
            .await
            .entry(destination)
            .or_insert(0) += 1;
    }

    pub async fn record_dlq(&self, destination: Destination, reason: &str) {
        *self
            .dlq_events
            .write()
            .await
            .entry((destination, reason.to_string()))
            .or_insert(0) += 1;
    }

    pub async fn record_parse_skip(&self) {
        *self.parse_skips.write().await += 1;
    }

    pub async fn set_lag_seconds(&self, destination: Destination, lag: f64) {
        self.lag_seconds.write().await.insert(destination, lag);
    }

    pub async fn set_events_per_second(&self, destination: Destination, eps: f64) {
        self.events_per_second
            .write()
            .await
            .insert(destination, eps);
    }

    pub async fn set_backlog_depth(&self, destination: Destination, depth: u64) {
        self.backlog_depth.write().await.insert(destination, depth);
    }

    pub async fn processed_total(&self, destination: Destination) -> u64 {
        self.events_processed
            .read()
            .await
            .iter()
            .filter(|((d, _), _)| *d == destination)
            .map(|(_, v)| *v)
            .sum()
    }

    pub async fn dlq_total(&self, destination: Destination) -> u64 {
        self.dlq_events
            .read()
            .await
            .iter()
            .filter(|((d, _), _)| *d == destination)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Render the Prometheus text exposition.
    pub async fn render(&self) -> String {
        let mut out = String::with_capacity(4096);

        out.push_str("# HELP cdc_pipeline_uptime_seconds Time since the pipeline started\n");
        out.push_str("# TYPE cdc_pipeline_uptime_seconds counter\n");
        out.push_str(&format!(
            "cdc_pipeline_uptime_seconds {:.3}\n\n",
            self.uptime_seconds()
        ));

        out.push_str("# HELP cdc_events_processed_total Events committed by destination and table\n");
        out.push_str("# TYPE cdc_events_processed_total counter\n");
        for ((dest, table), count) in sorted(&*self.events_processed.read().await) {
            out.push_str(&format!(
                "cdc_events_processed_total{{destination=\"{}\",table=\"{}\"}} {}\n",
                dest.label(),
                table,
                count
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_replication_lag_seconds Now minus committed source timestamp\n");
        out.push_str("# TYPE cdc_replication_lag_seconds gauge\n");
        for (dest, lag) in sorted(&*self.lag_seconds.read().await) {
            out.push_str(&format!(
                "cdc_replication_lag_seconds{{destination=\"{}\"}} {:.3}\n",
                dest.label(),
                lag
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_events_per_second Moving-average throughput by destination\n");
        out.push_str("# TYPE cdc_events_per_second gauge\n");
        for (dest, eps) in sorted(&*self.events_per_second.read().await) {
            out.push_str(&format!(
                "cdc_events_per_second{{destination=\"{}\"}} {:.3}\n",
                dest.label(),
                eps
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_errors_total Errors by destination and category\n");
        out.push_str("# TYPE cdc_errors_total counter\n");
        for ((dest, code), count) in sorted(&*self.errors.read().await) {
            out.push_str(&format!(
                "cdc_errors_total{{destination=\"{}\",error_category=\"{}\"}} {}\n",
                dest.label(),
                code,
                count
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_backlog_depth Events queued but not yet committed\n");
        out.push_str("# TYPE cdc_backlog_depth gauge\n");
        for (dest, depth) in sorted(&*self.backlog_depth.read().await) {
            out.push_str(&format!(
                "cdc_backlog_depth{{destination=\"{}\"}} {}\n",
                dest.label(),
                depth
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_retry_attempts_total Batch retry attempts by destination\n");
        out.push_str("# TYPE cdc_retry_attempts_total counter\n");
        for (dest, count) in sorted(&*self.retry_attempts.read().await) {
            out.push_str(&format!(
                "cdc_retry_attempts_total{{destination=\"{}\"}} {}\n",
                dest.label(),
                count
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_dlq_events_total Events dead-lettered by destination and reason\n");
        out.push_str("# TYPE cdc_dlq_events_total counter\n");
        for ((dest, reason), count) in sorted(&*self.dlq_events.read().await) {
            out.push_str(&format!(
                "cdc_dlq_events_total{{destination=\"{}\",reason=\"{}\"}} {}\n",
                dest.label(),
                reason,
                count
            ));
        }
        out.push('\n');

        out.push_str("# HELP cdc_parse_skips_total Malformed commit-log frames skipped\n");
        out.push_str("# TYPE cdc_parse_skips_total counter\n");
        out.push_str(&format!(
            "cdc_parse_skips_total {}\n",
            *self.parse_skips.read().await
        ));

        out
    }
}

/// Stable rendering order for label sets.
fn sorted<K: Clone + LabelKey, V: Clone>(map: &HashMap<K, V>) -> Vec<(K, V)> {
    let mut entries: Vec<(K, V)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    entries.sort_by_key(|(k, _)| k.sort_key());
    entries
}

trait LabelKey {
    fn sort_key(&self) -> String;
}

impl LabelKey for Destination {
    fn sort_key(&self) -> String {
        self.label().to_string()
    }
}

impl LabelKey for (Destination, String) {
    fn sort_key(&self) -> String {
        format!("{}/{}", self.0.label(), self.1)
    }
}

impl LabelKey for (Destination, &'static str) {
    fn sort_key(&self) -> String {
        format!("{}/{}", self.0.label(), self.1)
    }
}
