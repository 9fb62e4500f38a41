//! Run report and sinks
//!
//! The report keeps infrastructure trouble (transport errors, failed requests,
//! interrupted iterations) apart from correctness findings (replication lag,
//! duplicates accepted twice, cursor regressions).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Serialize;
use tracing::info;

use crate::error::{LoadError, Result};
use crate::metrics::{names, Aggregate, MetricsRegistry, SeriesStats, SeriesSummary, Tags};
use crate::scheduler::{PhaseSummary, RunOutcome};
use crate::threshold::{self, ThresholdRule, ThresholdStatus, Verdict};

// ============================================================================
// REPORT
// ============================================================================

/// Transport and protocol health of the run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Infrastructure {
    pub http_reqs: u64,
    pub http_req_failed_rate: f64,
    pub transport_errors: BTreeMap<String, u64>,
    pub iterations: u64,
    pub interrupted_iterations: u64,
    pub write_errors: u64,
    pub read_errors: u64,
    pub search_errors: u64,
    pub delete_errors: u64,
    /// Samples dropped for kind mismatches
    pub rejected_samples: u64,
}

/// A unique key that more than one insert claimed to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoubleWinner {
    pub key: String,
    pub wins: u64,
}

/// Correctness findings
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Findings {
    pub replication_checks: u64,
    pub replication_lag_detected: u64,
    pub replication_lag_rate: Option<f64>,
    pub replication_persistent_lag: u64,
    pub duplicate_attempts: u64,
    pub duplicate_rejected: u64,
    pub duplicate_not_rejected: u64,
    pub double_winners: Vec<DoubleWinner>,
    pub cursor_regressions: u64,
}

impl Findings {
    pub fn is_clean(&self) -> bool {
        self.replication_lag_detected == 0
            && self.duplicate_not_rejected == 0
            && self.double_winners.is_empty()
            && self.cursor_regressions == 0
    }
}

/// Everything a sink may render
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub stopped_early: bool,
    pub phases: Vec<PhaseSummary>,
    pub infrastructure: Infrastructure,
    pub findings: Findings,
    pub verdict: Verdict,
    pub series: Vec<SeriesSummary>,
}

fn rate_of(metrics: &MetricsRegistry, name: &str) -> Option<f64> {
    match metrics.query(name, &Tags::new()) {
        Some(Aggregate::Rate { hits, total }) if total > 0 => Some(hits as f64 / total as f64),
        _ => None,
    }
}

impl RunReport {
    /// Build the report from the final registry and evaluate thresholds
    pub fn build(outcome: &RunOutcome, metrics: &MetricsRegistry, rules: &[ThresholdRule]) -> Self {
        let infrastructure = Infrastructure {
            http_reqs: metrics.counter_total(names::HTTP_REQS),
            http_req_failed_rate: rate_of(metrics, names::HTTP_REQ_FAILED).unwrap_or(0.0),
            transport_errors: metrics.counter_by_tag(names::TRANSPORT_ERRORS, "kind"),
            iterations: metrics.counter_total(names::ITERATIONS),
            interrupted_iterations: metrics.counter_total(names::INTERRUPTED_ITERATIONS),
            write_errors: metrics.counter_total(names::WRITE_ERRORS),
            read_errors: metrics.counter_total(names::READ_ERRORS),
            search_errors: metrics.counter_total(names::SEARCH_ERRORS),
            delete_errors: metrics.counter_total(names::DELETE_ERRORS),
            rejected_samples: metrics.rejected(),
        };

        let double_winners = metrics
            .counter_by_tag(names::DUPLICATE_WON, "key")
            .into_iter()
            .filter(|(_, wins)| *wins > 1)
            .map(|(key, wins)| DoubleWinner { key, wins })
            .collect();
        let findings = Findings {
            replication_checks: metrics.counter_total(names::REPLICATION_CHECK_TOTAL),
            replication_lag_detected: metrics.counter_total(names::REPLICATION_LAG_DETECTED),
            replication_lag_rate: rate_of(metrics, names::REPLICATION_LAG_RATE),
            replication_persistent_lag: metrics.counter_total(names::REPLICATION_PERSISTENT_LAG),
            duplicate_attempts: metrics.counter_total(names::DUPLICATE_ATTEMPTS),
            duplicate_rejected: metrics.counter_total(names::DUPLICATE_REJECTED),
            duplicate_not_rejected: metrics.counter_total(names::DUPLICATE_NOT_REJECTED),
            double_winners,
            cursor_regressions: metrics.counter_total(names::CURSOR_REGRESSIONS),
        };

        Self {
            run_id: outcome.run_id.clone(),
            started_at: outcome.started_at,
            elapsed_secs: outcome.elapsed_secs,
            stopped_early: outcome.stopped_early,
            phases: outcome.phases.clone(),
            infrastructure,
            findings,
            verdict: threshold::evaluate(rules, metrics),
            series: metrics.snapshot(),
        }
    }

    /// Thresholds hold and no key was created twice
    pub fn passed(&self) -> bool {
        self.verdict.passed() && self.findings.double_winners.is_empty()
    }

    /// Human-readable box report
    pub fn render(&self) -> String {
        let mut out = String::new();
        let line = "═".repeat(62);
        let _ = writeln!(out, "\n╔{}╗", line);
        let _ = writeln!(out, "║{:^62}║", "SPLITLOAD RUN RESULTS");
        let _ = writeln!(out, "╠{}╣", line);
        let _ = writeln!(out, "║ Run:               {:<42}║", self.run_id);
        let _ = writeln!(out, "║ Duration:          {:>10.2} seconds{:24}║", self.elapsed_secs, "");
        if self.stopped_early {
            let _ = writeln!(out, "║ Stopped early{:48}║", "");
        }

        let _ = writeln!(out, "╠{}╣", line);
        let _ = writeln!(out, "║ PHASES{:55}║", "");
        for phase in &self.phases {
            let _ = writeln!(
                out,
                "║   {:<22} peak {:>5}  iters {:>8}  intr {:>4} ║",
                truncate(&phase.name, 22),
                phase.peak_workers,
                phase.iterations,
                phase.interrupted
            );
        }

        let infra = &self.infrastructure;
        let _ = writeln!(out, "╠{}╣", line);
        let _ = writeln!(out, "║ INFRASTRUCTURE{:47}║", "");
        let _ = writeln!(out, "║   HTTP requests:     {:>10}{:30}║", infra.http_reqs, "");
        let _ = writeln!(
            out,
            "║   Failed requests:   {:>9.2}%{:30}║",
            infra.http_req_failed_rate * 100.0,
            ""
        );
        for (kind, count) in &infra.transport_errors {
            let _ = writeln!(out, "║   Transport {:<9} {:>10}{:30}║", kind, count, "");
        }
        let _ = writeln!(out, "║   Iterations:        {:>10}{:30}║", infra.iterations, "");
        let _ = writeln!(out, "║   Interrupted:       {:>10}{:30}║", infra.interrupted_iterations, "");
        let _ = writeln!(
            out,
            "║   Errors w/r/s/d:    {:>6}/{:>6}/{:>6}/{:>6}{:12}║",
            infra.write_errors, infra.read_errors, infra.search_errors, infra.delete_errors, ""
        );

        let f = &self.findings;
        let _ = writeln!(out, "╠{}╣", line);
        let _ = writeln!(out, "║ CORRECTNESS FINDINGS{:41}║", "");
        if f.replication_checks > 0 {
            let _ = writeln!(
                out,
                "║   Replication lag:   {:>6} / {:<6} ({:>6.2}%){:17}║",
                f.replication_lag_detected,
                f.replication_checks,
                f.replication_lag_rate.unwrap_or(0.0) * 100.0,
                ""
            );
            let _ = writeln!(out, "║   Persistent lag:    {:>10}{:30}║", f.replication_persistent_lag, "");
        }
        if f.duplicate_attempts > 0 {
            let _ = writeln!(
                out,
                "║   Duplicates:        {:>6} tried, {:>6} rejected{:12}║",
                f.duplicate_attempts, f.duplicate_rejected, ""
            );
            let _ = writeln!(out, "║   Not rejected:      {:>10}{:30}║", f.duplicate_not_rejected, "");
        }
        for winner in &f.double_winners {
            let _ = writeln!(
                out,
                "║   ❌ Double winner:  {:<28} x{:<10}║",
                truncate(&winner.key, 28),
                winner.wins
            );
        }
        if f.cursor_regressions > 0 {
            let _ = writeln!(out, "║   Cursor regressions:{:>10}{:30}║", f.cursor_regressions, "");
        }
        if f.is_clean() {
            let _ = writeln!(out, "║   none{:55}║", "");
        }
        let _ = writeln!(out, "╚{}╝", line);

        if !self.verdict.results.is_empty() {
            let _ = writeln!(out, "\n{}", line);
            let _ = writeln!(out, "              THRESHOLDS");
            let _ = writeln!(out, "{}", line);
            for result in &self.verdict.results {
                let status = match result.status {
                    ThresholdStatus::Pass => "✅ PASS",
                    ThresholdStatus::Fail => "❌ FAIL",
                    ThresholdStatus::NoData => "➖ NO DATA",
                    ThresholdStatus::Incompatible => "❌ INCOMPATIBLE",
                };
                let _ = writeln!(out, "\n  {} {} - {}", result.selector, result.expression, status);
                if let Some(actual) = result.actual {
                    let _ = writeln!(out, "    Actual:   {:.3}", actual);
                }
            }
        }

        let _ = writeln!(out, "\n{}", line);
        if self.passed() {
            let _ = writeln!(out, "  OVERALL: ✅ ALL THRESHOLDS PASS");
        } else {
            let _ = writeln!(out, "  OVERALL: ❌ RUN FAILED");
        }
        let _ = writeln!(out, "{}\n", line);
        out
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max.saturating_sub(1)).chain(std::iter::once('…')).collect()
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Destination for the final report
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn emit(&self, report: &RunReport) -> Result<()>;
}

/// Box report on stdout
pub struct ConsoleSink;

impl ReportSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn emit(&self, report: &RunReport) -> Result<()> {
        print!("{}", report.render());
        Ok(())
    }
}

/// Pretty-printed JSON file
pub struct JsonFileSink {
    pub path: PathBuf,
}

impl ReportSink for JsonFileSink {
    fn name(&self) -> &'static str {
        "json"
    }

    fn emit(&self, report: &RunReport) -> Result<()> {
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, report)?;
        writer.flush()?;
        info!("JSON report written to {}", self.path.display());
        Ok(())
    }
}

/// Prometheus text exposition file
pub struct PrometheusSink {
    pub path: PathBuf,
}

fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn stat_values(stats: &SeriesStats) -> Vec<(&'static str, f64)> {
    match stats {
        SeriesStats::Counter { count } => vec![("count", *count as f64)],
        SeriesStats::Rate { rate, hits, total } => vec![
            ("rate", *rate),
            ("hits", *hits as f64),
            ("total", *total as f64),
        ],
        SeriesStats::Trend(t) => vec![
            ("count", t.count as f64),
            ("avg", t.avg_ms),
            ("min", t.min_ms),
            ("med", t.med_ms),
            ("max", t.max_ms),
            ("p90", t.p90_ms),
            ("p95", t.p95_ms),
            ("p99", t.p99_ms),
        ],
    }
}

impl PrometheusSink {
    /// Encode the report as Prometheus text
    pub fn encode(report: &RunReport) -> Result<String> {
        let sink_err = |e: prometheus::Error| LoadError::Sink {
            sink: "prometheus",
            reason: e.to_string(),
        };
        let registry = Registry::new();

        // Only tagged series; the untagged totals would double count in sums
        let mut by_metric: BTreeMap<&str, Vec<&SeriesSummary>> = BTreeMap::new();
        for row in &report.series {
            by_metric.entry(row.name.as_str()).or_default().push(row);
        }

        for (metric, rows) in by_metric {
            let tagged: Vec<&SeriesSummary> =
                rows.iter().copied().filter(|r| !r.tags.is_empty()).collect();
            let rows = if tagged.is_empty() { rows } else { tagged };

            let keys: BTreeSet<String> = rows
                .iter()
                .flat_map(|r| r.tags.iter().map(|(k, _)| sanitize(k)))
                .filter(|k| k != "stat")
                .collect();
            let mut labels: Vec<&str> = keys.iter().map(String::as_str).collect();
            labels.push("stat");

            let gauge = GaugeVec::new(
                Opts::new(
                    format!("splitload_{}", sanitize(metric)),
                    format!("splitload metric {}", metric),
                ),
                &labels,
            )
            .map_err(sink_err)?;

            for row in rows {
                let tag_values: BTreeMap<String, &str> =
                    row.tags.iter().map(|(k, v)| (sanitize(k), v.as_str())).collect();
                for (stat, value) in stat_values(&row.stats) {
                    let values: Vec<&str> = keys
                        .iter()
                        .map(|k| tag_values.get(k).copied().unwrap_or(""))
                        .chain(std::iter::once(stat))
                        .collect();
                    gauge.with_label_values(&values).set(value);
                }
            }
            registry.register(Box::new(gauge)).map_err(sink_err)?;
        }

        let thresholds = GaugeVec::new(
            Opts::new("splitload_threshold_passed", "1 when the threshold held"),
            &["selector", "expression", "status"],
        )
        .map_err(sink_err)?;
        for result in &report.verdict.results {
            let status = serde_json::to_value(result.status)?
                .as_str()
                .unwrap_or_default()
                .to_string();
            thresholds
                .with_label_values(&[&result.selector, &result.expression, &status])
                .set(if result.status.is_violation() { 0.0 } else { 1.0 });
        }
        registry.register(Box::new(thresholds)).map_err(sink_err)?;

        let passed = prometheus::Gauge::new("splitload_run_passed", "1 when the run passed")
            .map_err(sink_err)?;
        passed.set(if report.passed() { 1.0 } else { 0.0 });
        registry.register(Box::new(passed)).map_err(sink_err)?;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(sink_err)?;
        String::from_utf8(buffer).map_err(|e| LoadError::Sink {
            sink: "prometheus",
            reason: e.to_string(),
        })
    }
}

impl ReportSink for PrometheusSink {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn emit(&self, report: &RunReport) -> Result<()> {
        let text = Self::encode(report)?;
        std::fs::write(&self.path, text)?;
        info!("Prometheus metrics written to {}", self.path.display());
        Ok(())
    }
}

/// Hand the report to every sink, stopping at the first failure
pub fn emit_all(report: &RunReport, sinks: &[Box<dyn ReportSink>]) -> Result<()> {
    for sink in sinks {
        sink.emit(report)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome() -> RunOutcome {
        RunOutcome {
            run_id: "r1".into(),
            started_at: Utc::now(),
            elapsed_secs: 12.5,
            phases: vec![PhaseSummary {
                name: "contention".into(),
                operation: "duplicate_probe".into(),
                workers_spawned: 2,
                peak_workers: 2,
                iterations: 4,
                interrupted: 0,
                elapsed_secs: 12.0,
            }],
            stopped_early: false,
        }
    }

    fn sample_metrics() -> MetricsRegistry {
        let metrics = MetricsRegistry::new();
        let tags = Tags::new().with("phase", "contention");
        metrics.add(names::HTTP_REQS, 4, &tags);
        metrics.add(names::TRANSPORT_ERRORS, 1, &tags.with("kind", "timeout"));
        metrics.add(names::DUPLICATE_ATTEMPTS, 4, &tags);
        metrics.add(names::DUPLICATE_WON, 2, &tags.with("key", "PC-DUP-r1-0"));
        metrics.add(names::DUPLICATE_WON, 1, &tags.with("key", "PC-DUP-r1-1"));
        metrics.add(names::DUPLICATE_NOT_REJECTED, 1, &tags);
        metrics.trend(names::WRITE_LATENCY, 120.0, &tags);
        metrics.rate(names::SUCCESS_RATE, true, &tags);
        metrics
    }

    #[test]
    fn test_report_separates_findings() {
        let metrics = sample_metrics();
        let rules = vec![ThresholdRule::parse("success_rate", "rate>0.9").unwrap()];
        let report = RunReport::build(&outcome(), &metrics, &rules);

        assert_eq!(report.infrastructure.http_reqs, 4);
        assert_eq!(report.infrastructure.transport_errors.get("timeout"), Some(&1));
        assert_eq!(
            report.findings.double_winners,
            vec![DoubleWinner {
                key: "PC-DUP-r1-0".into(),
                wins: 2
            }]
        );
        assert_eq!(report.findings.duplicate_not_rejected, 1);
        assert!(report.verdict.passed());
        // Double winner fails the run even though thresholds hold
        assert!(!report.passed());

        let text = report.render();
        assert!(text.contains("CORRECTNESS FINDINGS"));
        assert!(text.contains("Double winner"));
        assert!(text.contains("RUN FAILED"));
    }

    #[tokio::test]
    async fn test_duplicate_timeout_stays_out_of_findings() {
        use crate::error::TransportError;
        use crate::operations::testing::{context, ScriptedClient};
        use crate::operations::{DuplicateProbe, Operation, WorkerState};

        let client = ScriptedClient::new(vec![Err(TransportError::Timeout)]);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new().with("phase", "contention");
        let ctx = context(&client, &metrics, &tags, std::time::Duration::ZERO);
        DuplicateProbe { pool_size: 1 }
            .execute(&ctx, &mut WorkerState::seeded(5))
            .await;

        let rules = vec![ThresholdRule::parse("duplicate_not_rejected", "count<1").unwrap()];
        let report = RunReport::build(&outcome(), &metrics, &rules);

        assert_eq!(report.infrastructure.transport_errors.get("timeout"), Some(&1));
        assert_eq!(report.findings.duplicate_not_rejected, 0);
        assert!(report.findings.is_clean());
        assert!(report.passed());
    }

    #[test]
    fn test_json_sink_writes_file() {
        let metrics = sample_metrics();
        let report = RunReport::build(&outcome(), &metrics, &[]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        JsonFileSink { path: path.clone() }.emit(&report).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["run_id"], "r1");
        assert_eq!(value["findings"]["double_winners"][0]["wins"], 2);
        assert!(value["series"].as_array().unwrap().len() > 5);
    }

    #[test]
    fn test_json_sink_reports_io_error() {
        let metrics = MetricsRegistry::new();
        let report = RunReport::build(&outcome(), &metrics, &[]);
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonFileSink {
            path: dir.path().join("missing").join("report.json"),
        };
        let err = sink.emit(&report).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_prometheus_encoding() {
        let metrics = sample_metrics();
        let rules = vec![ThresholdRule::parse("write_latency_ms", "p(95)<100").unwrap()];
        let report = RunReport::build(&outcome(), &metrics, &rules);

        let text = PrometheusSink::encode(&report).unwrap();
        assert!(text.contains("splitload_http_reqs{phase=\"contention\",stat=\"count\"} 4"));
        assert!(text.contains("key=\"PC-DUP-r1-0\""));
        assert!(text.contains("splitload_write_latency_ms{phase=\"contention\",stat=\"p95\"}"));
        assert!(text.contains("splitload_threshold_passed"));
        assert!(text.contains("splitload_run_passed 0"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.prom");
        PrometheusSink { path: path.clone() }.emit(&report).unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), text);
    }
}
