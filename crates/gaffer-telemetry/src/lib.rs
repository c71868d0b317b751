// SPDX-License-Identifier: MIT OR Apache-2.0
//! gaffer-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Logging bootstrap and a small thread-safe metrics registry rendered in
//! the text exposition format. The registry is shared behind an `Arc` and
//! threaded through components explicitly.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `level` feeds the env filter (`RUST_LOG` still wins when set); `json`
/// switches to the structured formatter for production log shipping.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_ascii_lowercase()));
    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

// f64 values live in AtomicU64 cells as raw bits.
fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Relaxed);
}

/// Monotone counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Add `v` (fractional increments allowed, e.g. USD).
    pub fn inc_by(&self, v: f64) {
        // CAS loop keeps concurrent float adds lossless.
        let mut current = self.value.load(Relaxed);
        loop {
            let next = (f64::from_bits(current) + v).to_bits();
            match self
                .value
                .compare_exchange_weak(current, next, Relaxed, Relaxed)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Add one.
    pub fn inc(&self) {
        self.inc_by(1.0);
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        load_f64(&self.value)
    }
}

/// Settable gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    /// Set the gauge.
    pub fn set(&self, v: f64) {
        store_f64(&self.value, v);
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        load_f64(&self.value)
    }
}

/// Counter family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: Mutex<BTreeMap<String, f64>>,
}

impl LabeledCounter {
    /// Add one to the labelled series.
    pub fn inc(&self, label: &str) {
        self.inc_by(label, 1.0);
    }

    /// Add `v` to the labelled series.
    pub fn inc_by(&self, label: &str, v: f64) {
        let mut values = self.values.lock().expect("metrics lock poisoned");
        *values.entry(label.to_string()).or_insert(0.0) += v;
    }

    /// Snapshot of every series.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values.lock().expect("metrics lock poisoned").clone()
    }
}

/// Gauge family keyed by one label value. Supports wholesale replacement so
/// recomputed classifications do not leave stale series behind.
#[derive(Debug, Default)]
pub struct LabeledGauge {
    values: Mutex<BTreeMap<String, f64>>,
}

impl LabeledGauge {
    /// Set one labelled series.
    pub fn set(&self, label: &str, v: f64) {
        let mut values = self.values.lock().expect("metrics lock poisoned");
        values.insert(label.to_string(), v);
    }

    /// Replace every series at once.
    pub fn replace(&self, next: BTreeMap<String, f64>) {
        *self.values.lock().expect("metrics lock poisoned") = next;
    }

    /// Snapshot of every series.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values.lock().expect("metrics lock poisoned").clone()
    }
}

/// Upper bounds for the stage-duration histogram, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 900.0, 1800.0,
];

#[derive(Debug, Clone)]
struct HistogramSeries {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
}

impl HistogramSeries {
    fn new() -> Self {
        Self {
            bucket_counts: vec![0; DURATION_BUCKETS.len()],
            count: 0,
            sum: 0.0,
        }
    }
}

/// Fixed-bucket histogram family keyed by one label value.
#[derive(Debug, Default)]
pub struct LabeledHistogram {
    series: Mutex<BTreeMap<String, HistogramSeries>>,
}

impl LabeledHistogram {
    /// Record one observation in seconds.
    pub fn observe(&self, label: &str, seconds: f64) {
        let mut series = self.series.lock().expect("metrics lock poisoned");
        let entry = series
            .entry(label.to_string())
            .or_insert_with(HistogramSeries::new);
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                entry.bucket_counts[i] += 1;
            }
        }
        entry.count += 1;
        entry.sum += seconds;
    }

    /// Total observations for a label.
    pub fn count(&self, label: &str) -> u64 {
        self.series
            .lock()
            .expect("metrics lock poisoned")
            .get(label)
            .map(|s| s.count)
            .unwrap_or(0)
    }

    fn render_into(&self, out: &mut String, name: &str, label_key: &str) {
        let series = self.series.lock().expect("metrics lock poisoned");
        for (label, s) in series.iter() {
            for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                out.push_str(&format!(
                    "{name}_bucket{{{label_key}=\"{label}\",le=\"{bound}\"}} {}\n",
                    s.bucket_counts[i]
                ));
            }
            out.push_str(&format!(
                "{name}_bucket{{{label_key}=\"{label}\",le=\"+Inf\"}} {}\n",
                s.count
            ));
            out.push_str(&format!("{name}_sum{{{label_key}=\"{label}\"}} {}\n", s.sum));
            out.push_str(&format!(
                "{name}_count{{{label_key}=\"{label}\"}} {}\n",
                s.count
            ));
        }
    }
}

/// Every metric the orchestrator and workers publish.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Jobs created, by intake source.
    pub jobs_created: LabeledCounter,
    /// Jobs finished, by terminal status.
    pub jobs_completed: LabeledCounter,
    /// Count of failed jobs on record.
    pub job_failures_total: Gauge,
    /// Failed jobs grouped by failure category.
    pub job_failures_by_category: LabeledGauge,
    /// Failed jobs grouped by stage.
    pub job_failures_by_stage: LabeledGauge,
    /// Stage wall-clock durations.
    pub stage_duration: LabeledHistogram,
    /// Current queue depth.
    pub queue_depth: Gauge,
    /// Jobs currently awaiting approval.
    pub pending_approvals: Gauge,
    /// Unix timestamp of the last worker heartbeat.
    pub worker_heartbeat: Gauge,
    /// Daily spend in USD at the last governor check.
    pub spend_daily: Gauge,
    /// Monthly spend in USD at the last governor check.
    pub spend_monthly: Gauge,
    /// Total USD charged to jobs.
    pub job_cost_total: Counter,
    /// Recorded incidents, by `type/severity`.
    pub incidents: LabeledCounter,
    /// Whether agents are enabled (1) or killed (0).
    pub agents_enabled: Gauge,
}

impl Metrics {
    /// Fresh registry with every series empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Render the registry in text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        render_labeled_counter(
            &mut out,
            "gaffer_jobs_created_total",
            "Number of jobs created",
            "source",
            &self.jobs_created,
        );
        render_labeled_counter(
            &mut out,
            "gaffer_jobs_completed_total",
            "Number of jobs completed",
            "status",
            &self.jobs_completed,
        );
        render_gauge(
            &mut out,
            "gaffer_job_failures_total",
            "Total number of failed jobs",
            &self.job_failures_total,
        );
        render_labeled_gauge(
            &mut out,
            "gaffer_job_failures_by_category",
            "Failed jobs grouped by failure category",
            "category",
            &self.job_failures_by_category,
        );
        render_labeled_gauge(
            &mut out,
            "gaffer_job_failures_by_stage",
            "Failed jobs grouped by stage",
            "stage",
            &self.job_failures_by_stage,
        );

        out.push_str("# HELP gaffer_job_stage_duration_seconds Duration by job stage\n");
        out.push_str("# TYPE gaffer_job_stage_duration_seconds histogram\n");
        self.stage_duration
            .render_into(&mut out, "gaffer_job_stage_duration_seconds", "stage");

        render_gauge(&mut out, "gaffer_queue_depth", "Current queued jobs", &self.queue_depth);
        render_gauge(
            &mut out,
            "gaffer_pending_approvals",
            "Current jobs awaiting approval",
            &self.pending_approvals,
        );
        render_gauge(
            &mut out,
            "gaffer_worker_heartbeat_timestamp",
            "Last worker heartbeat timestamp",
            &self.worker_heartbeat,
        );
        render_gauge(&mut out, "gaffer_spend_daily_usd", "Daily spend in USD", &self.spend_daily);
        render_gauge(
            &mut out,
            "gaffer_spend_monthly_usd",
            "Monthly spend in USD",
            &self.spend_monthly,
        );

        out.push_str("# HELP gaffer_job_cost_usd_total Total USD spent on jobs\n");
        out.push_str("# TYPE gaffer_job_cost_usd_total counter\n");
        out.push_str(&format!("gaffer_job_cost_usd_total {}\n", self.job_cost_total.get()));

        render_labeled_counter(
            &mut out,
            "gaffer_incidents_total",
            "Recorded incidents",
            "kind",
            &self.incidents,
        );
        render_gauge(
            &mut out,
            "gaffer_agents_enabled",
            "Whether agents are enabled (1=true, 0=false)",
            &self.agents_enabled,
        );

        out
    }
}

fn render_gauge(out: &mut String, name: &str, help: &str, gauge: &Gauge) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {}\n", gauge.get()));
}

fn render_labeled_counter(
    out: &mut String,
    name: &str,
    help: &str,
    label_key: &str,
    counter: &LabeledCounter,
) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n"));
    for (label, value) in counter.snapshot() {
        out.push_str(&format!("{name}{{{label_key}=\"{label}\"}} {value}\n"));
    }
}

fn render_labeled_gauge(
    out: &mut String,
    name: &str,
    help: &str,
    label_key: &str,
    gauge: &LabeledGauge,
) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n"));
    for (label, value) in gauge.snapshot() {
        out.push_str(&format!("{name}{{{label_key}=\"{label}\"}} {value}\n"));
    }
}

/// Content type for [`Metrics::render`] output.
pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates() {
        let c = Counter::default();
        c.inc();
        c.inc_by(2.5);
        assert!((c.get() - 3.5).abs() < 1e-9);
    }

    #[test]
    fn gauge_overwrites() {
        let g = Gauge::default();
        g.set(4.0);
        g.set(1.5);
        assert!((g.get() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn labeled_counter_tracks_series_independently() {
        let c = LabeledCounter::default();
        c.inc("webhook");
        c.inc("webhook");
        c.inc("manual");
        let snap = c.snapshot();
        assert!((snap["webhook"] - 2.0).abs() < 1e-9);
        assert!((snap["manual"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn labeled_gauge_replace_drops_stale_series() {
        let g = LabeledGauge::default();
        g.set("old_category", 3.0);
        g.replace(BTreeMap::from([("budget_cap".to_string(), 1.0)]));
        let snap = g.snapshot();
        assert!(!snap.contains_key("old_category"));
        assert!((snap["budget_cap"] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = LabeledHistogram::default();
        h.observe("triage", 0.3);
        h.observe("triage", 4.0);
        h.observe("triage", 2000.0);
        assert_eq!(h.count("triage"), 3);
        assert_eq!(h.count("plan"), 0);

        let mut out = String::new();
        h.render_into(&mut out, "x", "stage");
        assert!(out.contains("x_bucket{stage=\"triage\",le=\"0.5\"} 1"));
        assert!(out.contains("x_bucket{stage=\"triage\",le=\"5\"} 2"));
        assert!(out.contains("x_bucket{stage=\"triage\",le=\"+Inf\"} 3"));
        assert!(out.contains("x_count{stage=\"triage\"} 3"));
    }

    #[test]
    fn render_includes_every_family() {
        let metrics = Metrics::new();
        metrics.jobs_created.inc("webhook");
        metrics.jobs_completed.inc("completed");
        metrics.stage_duration.observe("triage", 1.0);
        metrics.agents_enabled.set(1.0);

        let text = metrics.render();
        assert!(text.contains("gaffer_jobs_created_total{source=\"webhook\"} 1"));
        assert!(text.contains("gaffer_jobs_completed_total{status=\"completed\"} 1"));
        assert!(text.contains("gaffer_job_stage_duration_seconds_count{stage=\"triage\"} 1"));
        assert!(text.contains("gaffer_agents_enabled 1"));
        assert!(text.contains("# TYPE gaffer_queue_depth gauge"));
    }
}
