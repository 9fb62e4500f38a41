//! Concurrent metric aggregation
//!
//! Every sample carries a metric name and a tag set. Samples with the same
//! name and tags accumulate into one series; queries merge every series of a
//! metric whose tags contain the requested filter, so `read_latency_ms`
//! covers all phases while `read_latency_ms{phase:stress}` covers one.
//!
//! All accumulation is commutative: counters and rates are atomic sums and
//! trends are HDR histograms, which merge by bucket-wise addition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Well-known metric names
pub mod names {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration_ms";
    pub const INTERRUPTED_ITERATIONS: &str = "interrupted_iterations";
    pub const TRANSPORT_ERRORS: &str = "transport_errors";
    pub const SUCCESS_RATE: &str = "success_rate";

    pub const WRITE_LATENCY: &str = "write_latency_ms";
    pub const READ_LATENCY: &str = "read_latency_ms";
    pub const SEARCH_LATENCY: &str = "search_latency_ms";
    pub const DELETE_LATENCY: &str = "delete_latency_ms";

    pub const WRITE_ERRORS: &str = "write_errors";
    pub const READ_ERRORS: &str = "read_errors";
    pub const SEARCH_ERRORS: &str = "search_errors";
    pub const DELETE_ERRORS: &str = "delete_errors";

    pub const INSERTED_TOTAL: &str = "inserted_total";
    pub const DELETED_TOTAL: &str = "deleted_total";
    pub const DELETE_MISSING_TOTAL: &str = "delete_missing_total";
    pub const EMPTY_PAGE_TOTAL: &str = "empty_page_total";
    pub const CURSOR_REGRESSIONS: &str = "cursor_regressions";
    pub const SMALL_PAGE_TOTAL: &str = "small_page_total";
    pub const SEARCH_GPU_TOTAL: &str = "search_gpu_total";
    pub const SEARCH_RAM_TOTAL: &str = "search_ram_total";

    pub const REPLICATION_CHECK_TOTAL: &str = "replication_check_total";
    pub const REPLICATION_LAG_DETECTED: &str = "replication_lag_detected";
    pub const REPLICATION_LAG_RATE: &str = "replication_lag_rate";
    pub const REPLICATION_RETRY_CHECKS: &str = "replication_retry_checks";
    pub const REPLICATION_RETRY_FOUND: &str = "replication_retry_found";
    pub const REPLICATION_PERSISTENT_LAG: &str = "replication_persistent_lag";

    pub const DUPLICATE_ATTEMPTS: &str = "duplicate_insert_attempts";
    pub const DUPLICATE_WON: &str = "duplicate_insert_won";
    pub const DUPLICATE_REJECTED: &str = "duplicate_correctly_rejected";
    pub const DUPLICATE_NOT_REJECTED: &str = "duplicate_not_rejected";

    pub const BURST_LATENCY: &str = "burst_phase_latency_ms";
    pub const RECOVERY_LATENCY: &str = "recovery_phase_latency_ms";
    pub const SOAK_EARLY_LATENCY: &str = "soak_latency_early_ms";
    pub const SOAK_MID_LATENCY: &str = "soak_latency_mid_ms";
    pub const SOAK_LATE_LATENCY: &str = "soak_latency_late_ms";
}

/// Trend values are stored in microseconds: 1µs to 1h
const TREND_LOW_US: u64 = 1;
const TREND_HIGH_US: u64 = 3_600_000_000;
const TREND_SIGFIG: u8 = 3;

// ============================================================================
// TAGS & SAMPLES
// ============================================================================

/// Ordered tag set; ordering makes equal sets hash and compare equal
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy with one tag added or replaced
    pub fn with(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut tags = self.clone();
        tags.insert(key, value);
        tags
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// True when every tag of `filter` is present here with the same value
    pub fn contains(&self, filter: &Tags) -> bool {
        filter
            .0
            .iter()
            .all(|(k, v)| self.0.get(k).map_or(false, |mine| mine == v))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", k, v)?;
        }
        write!(f, "}}")
    }
}

/// Metric type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic sum
    Counter,
    /// Fraction of true observations
    Rate,
    /// Latency distribution, values in milliseconds
    Trend,
}

/// One observation emitted by an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
}

impl MetricSample {
    pub fn counter(name: &str, value: u64, tags: &Tags) -> Self {
        Self {
            name: name.to_string(),
            kind: MetricKind::Counter,
            value: value as f64,
            tags: tags.clone(),
        }
    }

    pub fn rate(name: &str, hit: bool, tags: &Tags) -> Self {
        Self {
            name: name.to_string(),
            kind: MetricKind::Rate,
            value: if hit { 1.0 } else { 0.0 },
            tags: tags.clone(),
        }
    }

    pub fn trend(name: &str, millis: f64, tags: &Tags) -> Self {
        Self {
            name: name.to_string(),
            kind: MetricKind::Trend,
            value: millis,
            tags: tags.clone(),
        }
    }
}

// ============================================================================
// SERIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    tags: Tags,
}

enum Series {
    Counter(AtomicU64),
    Rate { hits: AtomicU64, total: AtomicU64 },
    Trend(Mutex<Histogram<u64>>),
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(TREND_LOW_US, TREND_HIGH_US, TREND_SIGFIG)
        .expect("constant histogram bounds") // 1µs to 1h
}

fn millis_to_micros(millis: f64) -> u64 {
    if !millis.is_finite() || millis <= 0.0 {
        return 0;
    }
    ((millis * 1000.0).round() as u64).min(TREND_HIGH_US)
}

impl Series {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(AtomicU64::new(0)),
            MetricKind::Rate => Self::Rate {
                hits: AtomicU64::new(0),
                total: AtomicU64::new(0),
            },
            MetricKind::Trend => Self::Trend(Mutex::new(new_histogram())),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    fn apply(&self, value: f64) {
        match self {
            Self::Counter(count) => {
                let add = if value.is_finite() && value > 0.0 {
                    value.round() as u64
                } else {
                    0
                };
                count.fetch_add(add, Ordering::Relaxed);
            }
            Self::Rate { hits, total } => {
                total.fetch_add(1, Ordering::Relaxed);
                if value != 0.0 {
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }
            Self::Trend(hist) => {
                hist.lock().saturating_record(millis_to_micros(value));
            }
        }
    }

    fn aggregate(&self) -> Aggregate {
        match self {
            Self::Counter(count) => Aggregate::Counter(count.load(Ordering::Relaxed)),
            Self::Rate { hits, total } => Aggregate::Rate {
                hits: hits.load(Ordering::Relaxed),
                total: total.load(Ordering::Relaxed),
            },
            Self::Trend(hist) => Aggregate::Trend(TrendAggregate {
                histogram: hist.lock().clone(),
            }),
        }
    }
}

// ============================================================================
// AGGREGATES
// ============================================================================

/// Merged view of one or more series
#[derive(Debug, Clone)]
pub enum Aggregate {
    Counter(u64),
    Rate { hits: u64, total: u64 },
    Trend(TrendAggregate),
}

impl Aggregate {
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend(_) => MetricKind::Trend,
        }
    }

    /// Number of observations behind the aggregate
    pub fn observations(&self) -> u64 {
        match self {
            Self::Counter(count) => *count,
            Self::Rate { total, .. } => *total,
            Self::Trend(trend) => trend.count(),
        }
    }

    fn merge(&mut self, other: Aggregate) {
        match (self, other) {
            (Self::Counter(a), Self::Counter(b)) => *a += b,
            (Self::Rate { hits, total }, Self::Rate { hits: h, total: t }) => {
                *hits += h;
                *total += t;
            }
            (Self::Trend(a), Self::Trend(b)) => {
                if let Err(e) = a.histogram.add(&b.histogram) {
                    warn!("Failed to merge latency histograms: {}", e);
                }
            }
            // Kinds are pinned per metric name at record time.
            _ => {}
        }
    }
}

/// Latency distribution in milliseconds
#[derive(Debug, Clone)]
pub struct TrendAggregate {
    histogram: Histogram<u64>,
}

impl TrendAggregate {
    pub fn count(&self) -> u64 {
        self.histogram.len()
    }

    /// Percentile in `[0, 100]`, nearest-rank over HDR buckets
    pub fn percentile(&self, p: f64) -> f64 {
        micros_to_millis(self.histogram.value_at_quantile((p / 100.0).clamp(0.0, 1.0)))
    }

    pub fn avg(&self) -> f64 {
        self.histogram.mean() / 1000.0
    }

    pub fn min(&self) -> f64 {
        micros_to_millis(self.histogram.min())
    }

    pub fn max(&self) -> f64 {
        micros_to_millis(self.histogram.max())
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    pub fn stats(&self) -> TrendStats {
        TrendStats {
            count: self.count(),
            avg_ms: self.avg(),
            min_ms: self.min(),
            med_ms: self.med(),
            max_ms: self.max(),
            p90_ms: self.percentile(90.0),
            p95_ms: self.percentile(95.0),
            p99_ms: self.percentile(99.0),
        }
    }
}

fn micros_to_millis(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Printable trend statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub med_ms: f64,
    pub max_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Printable statistics for one series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeriesStats {
    Counter { count: u64 },
    Rate { rate: f64, hits: u64, total: u64 },
    Trend(TrendStats),
}

impl From<&Aggregate> for SeriesStats {
    fn from(aggregate: &Aggregate) -> Self {
        match aggregate {
            Aggregate::Counter(count) => Self::Counter { count: *count },
            Aggregate::Rate { hits, total } => Self::Rate {
                rate: if *total > 0 {
                    *hits as f64 / *total as f64
                } else {
                    0.0
                },
                hits: *hits,
                total: *total,
            },
            Aggregate::Trend(trend) => Self::Trend(trend.stats()),
        }
    }
}

/// One row of a registry snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub name: String,
    pub tags: Tags,
    pub stats: SeriesStats,
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Shared sink for every worker's samples
#[derive(Default)]
pub struct MetricsRegistry {
    series: DashMap<SeriesKey, Series>,
    kinds: DashMap<String, MetricKind>,
    rejected: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one sample.
    ///
    /// The first sample for a name fixes its kind; later samples of another
    /// kind are dropped and counted in [`MetricsRegistry::rejected`].
    pub fn record(&self, sample: &MetricSample) {
        let pinned = self.pin_kind(&sample.name, sample.kind);
        if pinned != sample.kind {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dropping {:?} sample for `{}` registered as {:?}",
                sample.kind, sample.name, pinned
            );
            return;
        }

        let key = SeriesKey {
            name: sample.name.clone(),
            tags: sample.tags.clone(),
        };
        if let Some(series) = self.series.get(&key) {
            series.apply(sample.value);
            return;
        }
        self.series
            .entry(key)
            .or_insert_with(|| Series::new(sample.kind))
            .apply(sample.value);
    }

    /// Kind already registered for `name`, registering `kind` on first use
    fn pin_kind(&self, name: &str, kind: MetricKind) -> MetricKind {
        if let Some(pinned) = self.kinds.get(name) {
            return *pinned.value();
        }
        *self
            .kinds
            .entry(name.to_string())
            .or_insert(kind)
            .value()
    }

    pub fn add(&self, name: &str, value: u64, tags: &Tags) {
        self.record(&MetricSample::counter(name, value, tags));
    }

    pub fn rate(&self, name: &str, hit: bool, tags: &Tags) {
        self.record(&MetricSample::rate(name, hit, tags));
    }

    pub fn trend(&self, name: &str, millis: f64, tags: &Tags) {
        self.record(&MetricSample::trend(name, millis, tags));
    }

    /// Samples dropped because of a kind mismatch
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.kinds.get(name).map(|k| *k.value())
    }

    /// Merge every series of `name` whose tags contain `filter`
    pub fn query(&self, name: &str, filter: &Tags) -> Option<Aggregate> {
        let mut merged: Option<Aggregate> = None;
        for entry in self.series.iter() {
            let key = entry.key();
            if key.name != name || !key.tags.contains(filter) {
                continue;
            }
            let aggregate = entry.value().aggregate();
            match merged.as_mut() {
                Some(acc) => acc.merge(aggregate),
                None => merged = Some(aggregate),
            }
        }
        merged
    }

    /// Counter total for `name` across all tags (0 when never recorded)
    pub fn counter_total(&self, name: &str) -> u64 {
        match self.query(name, &Tags::new()) {
            Some(Aggregate::Counter(count)) => count,
            _ => 0,
        }
    }

    /// Counter totals for `name` grouped by the value of tag `tag_key`
    pub fn counter_by_tag(&self, name: &str, tag_key: &str) -> BTreeMap<String, u64> {
        let mut grouped = BTreeMap::new();
        for entry in self.series.iter() {
            let key = entry.key();
            if key.name != name {
                continue;
            }
            let (Some(value), Series::Counter(count)) = (key.tags.get(tag_key), entry.value())
            else {
                continue;
            };
            *grouped.entry(value.to_string()).or_insert(0) += count.load(Ordering::Relaxed);
        }
        grouped
    }

    /// Distinct metric names seen so far, sorted
    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kinds.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Per-metric totals followed by every individual series, sorted by name then tags
    pub fn snapshot(&self) -> Vec<SeriesSummary> {
        let mut keys: Vec<SeriesKey> = self.series.iter().map(|e| e.key().clone()).collect();
        keys.sort();

        let mut rows = Vec::with_capacity(keys.len());
        for name in self.metric_names() {
            if let Some(total) = self.query(&name, &Tags::new()) {
                rows.push(SeriesSummary {
                    name: name.clone(),
                    tags: Tags::new(),
                    stats: SeriesStats::from(&total),
                });
            }
            for key in keys.iter().filter(|k| k.name == name && !k.tags.is_empty()) {
                if let Some(series) = self.series.get(key) {
                    rows.push(SeriesSummary {
                        name: name.clone(),
                        tags: key.tags.clone(),
                        stats: SeriesStats::from(&series.aggregate()),
                    });
                }
            }
        }
        rows
    }
}
