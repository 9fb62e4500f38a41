//! Integration tests for whole scenarios
//!
//! Overlapping phases, threshold evaluation and a config-driven run with
//! report sinks.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use splitload_core::metrics::{names, Tags};
use splitload_core::ramp::Stage;
use splitload_core::report::{JsonFileSink, PrometheusSink, ReportSink};
use splitload_core::threshold::{self, ThresholdStatus};
use splitload_core::{
    MetricsRegistry, OperationKind, PhaseSpec, Ramp, RunConfig, RunReport, Scheduler,
    SchedulerConfig, ThresholdRule,
};
use support::FakeService;

fn reads() -> OperationKind {
    OperationKind::PaginatedRead {
        page_size: Some(20),
        min_body_bytes: None,
    }
}

mod population_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_phases_sum() {
        let service = FakeService::new(Duration::ZERO).with_latency(Duration::from_millis(100));
        service.seed(100);

        let phases = vec![
            // Ramps 0 -> 50 over 10s from t=10s, then holds 20s
            PhaseSpec::new(
                "ramp_a",
                Ramp::new(
                    Duration::from_secs(10),
                    vec![Stage::new(10, 50), Stage::new(20, 50)],
                ),
                reads(),
            )
            .grace(Duration::from_secs(2)),
            // Flat 10 from t=10s for 30s
            PhaseSpec::new("flat_b", Ramp::constant(Duration::from_secs(10), 10, 30), reads())
                .grace(Duration::from_secs(2)),
            // Over well before t=15s
            PhaseSpec::new("warmup_c", Ramp::constant(Duration::ZERO, 5, 8), reads())
                .grace(Duration::from_secs(1)),
        ];
        let metrics = Arc::new(MetricsRegistry::new());
        let scheduler = Scheduler::new(
            phases,
            Arc::new(service),
            metrics,
            SchedulerConfig {
                progress_interval: None,
                ..SchedulerConfig::default()
            },
        );
        let active = scheduler.active_workers();
        let stop = scheduler.stop_token();
        let handle = tokio::spawn(scheduler.run());

        tokio::time::sleep(Duration::from_millis(15_050)).await;
        let counts: Vec<i64> = active
            .iter()
            .map(|(_, count)| count.load(Ordering::Relaxed) as i64)
            .collect();
        assert!((counts[0] - 25).abs() <= 1, "ramp_a: {}", counts[0]);
        assert_eq!(counts[1], 10);
        assert_eq!(counts[2], 0);
        let total: i64 = counts.iter().sum();
        assert!((total - 35).abs() <= 1, "total: {total}");

        stop.cancel();
        let outcome = handle.await.unwrap();
        assert!(outcome.stopped_early);
        assert_eq!(outcome.phases.len(), 3);
        assert_eq!(outcome.phases[2].peak_workers, 5);
    }
}

mod threshold_tests {
    use super::*;

    #[test]
    fn test_p95_nearest_rank_reports_actual() {
        let metrics = MetricsRegistry::new();
        let tags = Tags::new().with("phase", "reads");
        for latency in [100.0, 120.0, 150.0, 290.0, 310.0, 140.0] {
            metrics.trend(names::READ_LATENCY, latency, &tags);
        }

        let rule = ThresholdRule::parse("read_latency_ms", "p(95)<300").unwrap();
        let verdict = threshold::evaluate(&[rule], &metrics);

        assert!(!verdict.passed());
        let result = &verdict.results[0];
        assert_eq!(result.status, ThresholdStatus::Fail);
        let actual = result.actual.unwrap();
        assert!((actual - 310.0).abs() < 1.0, "actual {actual}");
    }

    #[test]
    fn test_filtered_rule_ignores_other_phases() {
        let metrics = MetricsRegistry::new();
        metrics.trend(names::READ_LATENCY, 900.0, &Tags::new().with("phase", "stress"));
        metrics.trend(names::READ_LATENCY, 80.0, &Tags::new().with("phase", "reads"));

        let rules = vec![
            ThresholdRule::parse("read_latency_ms{phase:reads}", "p(95)<300").unwrap(),
            ThresholdRule::parse("read_latency_ms{phase:missing}", "p(95)<300").unwrap(),
        ];
        let verdict = threshold::evaluate(&rules, &metrics);

        assert_eq!(verdict.results[0].status, ThresholdStatus::Pass);
        assert_eq!(verdict.results[1].status, ThresholdStatus::NoData);
        assert!(verdict.passed());
    }
}

mod end_to_end_tests {
    use super::*;

    const SCENARIO: &str = r#"
base_url = "http://fake.invalid"
page_size = 20
progress_interval_secs = 0
seed = 11

[[phases]]
name = "writes"
workers = 3
duration_secs = 5
grace_secs = 2
tags = { group = "writes" }
operation = { kind = "write_cleanup", settle_ms = 200 }

[[phases]]
name = "reads"
stages = [{ duration_secs = 2, target = 6 }, { duration_secs = 3, target = 6 }]
grace_secs = 2
think_time = { min_ms = 50, max_ms = 150 }
operation = { kind = "paginated_read" }

[[phases]]
name = "search"
start_secs = 1
workers = 2
duration_secs = 4
operation = { kind = "search", gpu_terms = ["RTX"], ram_capacities = [32] }

[[phases]]
name = "deletes"
start_secs = 1
workers = 1
duration_secs = 3
iterations_per_worker = 10
operation = { kind = "delete" }

[thresholds]
"read_latency_ms{phase:reads}" = ["p(95)<100"]
"write_latency_ms{group:writes}" = ["p(95)<100", "max<50"]
success_rate = ["rate>0.99"]
http_req_failed = ["rate<0.01"]
write_errors = ["count<1"]
duplicate_not_rejected = ["count<1"]
"#;

    #[tokio::test(start_paused = true)]
    async fn test_config_driven_run() {
        let config = RunConfig::from_toml(SCENARIO).unwrap();
        let service = FakeService::new(Duration::ZERO).with_latency(Duration::from_millis(10));
        service.seed(60);
        let service = Arc::new(service);

        let metrics = Arc::new(MetricsRegistry::new());
        let rules = config.rules().unwrap();
        let scheduler = Scheduler::new(
            config.phase_specs().unwrap(),
            service.clone(),
            metrics.clone(),
            config.scheduler_config(),
        );
        let outcome = scheduler.run().await;
        let report = RunReport::build(&outcome, &metrics, &rules);

        assert!(!outcome.stopped_early);
        assert_eq!(report.phases.len(), 4);
        let deletes = report.phases.iter().find(|p| p.name == "deletes").unwrap();
        assert_eq!(deletes.iterations, 10);

        assert!(report.infrastructure.http_reqs > 100);
        assert_eq!(report.infrastructure.http_req_failed_rate, 0.0);
        assert!(report.findings.is_clean());
        assert!(metrics.counter_total(names::SEARCH_GPU_TOTAL) + metrics.counter_total(names::SEARCH_RAM_TOTAL) > 0);
        assert!(metrics.counter_total(names::INSERTED_TOTAL) > 0);
        // Cleanup removed every write
        assert_eq!(service.len(), 60);

        let no_data = report
            .verdict
            .results
            .iter()
            .find(|r| r.selector == "duplicate_not_rejected")
            .unwrap();
        assert_eq!(no_data.status, ThresholdStatus::NoData);
        assert!(report.passed(), "{}", report.render());

        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("report.json");
        let prom = dir.path().join("run.prom");
        JsonFileSink { path: json.clone() }.emit(&report).unwrap();
        PrometheusSink { path: prom.clone() }.emit(&report).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(json).unwrap()).unwrap();
        assert_eq!(value["phases"].as_array().unwrap().len(), 4);
        let text = std::fs::read_to_string(prom).unwrap();
        assert!(text.contains("splitload_run_passed 1"));
        assert!(text.contains("phase=\"reads\""));
    }
}
