//! Built-in scenarios
//!
//! - `standard`: read-heavy production mix with write/cleanup and searches
//! - `heavy`: aggressive warm-up, parallel read/write/search/delete, then a
//!   500-worker mixed stress spike
//! - `exploratory`: replication lag, duplicate contention, soak degradation,
//!   burst recovery and large pages

use std::collections::BTreeMap;

use crate::config::{PhaseConfig, RunConfig};
use crate::error::{LoadError, Result};
use crate::operations::OperationKind;
use crate::ramp::Stage;
use crate::worker::ThinkTime;

/// Names accepted by [`preset`]
pub const PRESETS: &[&str] = &["standard", "heavy", "exploratory"];

/// Look up a built-in scenario
pub fn preset(name: &str) -> Result<RunConfig> {
    let config = match name {
        "standard" => standard(),
        "heavy" => heavy(),
        "exploratory" => exploratory(),
        other => return Err(LoadError::UnknownPreset(other.to_string())),
    };
    Ok(config)
}

fn ramped(
    name: &str,
    start_secs: u64,
    grace_secs: u64,
    stages: &[(u64, u32)],
    operation: OperationKind,
) -> PhaseConfig {
    PhaseConfig {
        name: name.to_string(),
        start_secs,
        stages: stages.iter().map(|&(d, t)| Stage::new(d, t)).collect(),
        workers: None,
        duration_secs: None,
        grace_secs,
        iterations_per_worker: None,
        think_time: None,
        tags: BTreeMap::new(),
        operation,
    }
}

fn constant(
    name: &str,
    start_secs: u64,
    grace_secs: u64,
    workers: u32,
    duration_secs: u64,
    operation: OperationKind,
) -> PhaseConfig {
    PhaseConfig {
        workers: Some(workers),
        duration_secs: Some(duration_secs),
        ..ramped(name, start_secs, grace_secs, &[], operation)
    }
}

fn group(mut phase: PhaseConfig, group: &str) -> PhaseConfig {
    phase.tags.insert("group".to_string(), group.to_string());
    phase
}

fn thresholds(rules: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (selector, predicate) in rules {
        map.entry(selector.to_string())
            .or_default()
            .push(predicate.to_string());
    }
    map
}

fn paginated(page_size: Option<u32>) -> OperationKind {
    OperationKind::PaginatedRead {
        page_size,
        min_body_bytes: None,
    }
}

fn standard() -> RunConfig {
    let mut reads = ramped(
        "reads",
        0,
        10,
        &[(30, 20), (60, 50), (30, 100), (30, 50), (30, 0)],
        paginated(None),
    );
    reads.think_time = Some(ThinkTime::new(1000, 3000));

    let mut writes = ramped(
        "writes",
        15,
        10,
        &[(30, 5), (60, 15), (30, 5), (30, 0)],
        OperationKind::WriteCleanup { settle_ms: 1500 },
    );
    writes.think_time = Some(ThinkTime::new(1000, 3000));

    let mut search = constant(
        "search",
        30,
        10,
        10,
        120,
        OperationKind::Search {
            gpu_terms: ["RTX", "RX", "GTX", "4070", "3060", "7900"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            ram_capacities: vec![16, 32, 64],
        },
    );
    search.think_time = Some(ThinkTime::new(1000, 2000));

    RunConfig {
        phases: vec![reads, writes, search],
        thresholds: thresholds(&[
            ("read_latency_ms{phase:reads}", "p(95)<500"),
            ("write_latency_ms{phase:writes}", "p(95)<1000"),
            ("search_latency_ms{phase:search}", "p(95)<800"),
            ("success_rate", "rate>0.99"),
            ("write_errors", "count<10"),
        ]),
        ..RunConfig::default()
    }
}

fn heavy() -> RunConfig {
    let search = || OperationKind::Search {
        gpu_terms: Vec::new(),
        ram_capacities: Vec::new(),
    };
    RunConfig {
        page_size: 50,
        phases: vec![
            group(
                ramped("warmup_writes", 0, 3, &[(5, 100), (25, 100)], OperationKind::Write),
                "warmup",
            ),
            group(
                ramped(
                    "parallel_writes",
                    30,
                    3,
                    &[(10, 50), (50, 50), (20, 30), (10, 0)],
                    OperationKind::Write,
                ),
                "parallel",
            ),
            group(
                ramped(
                    "parallel_reads",
                    30,
                    5,
                    &[(10, 100), (30, 200), (30, 200), (20, 0)],
                    paginated(None),
                ),
                "parallel",
            ),
            group(
                ramped(
                    "parallel_search",
                    30,
                    5,
                    &[(10, 50), (40, 100), (20, 100), (20, 0)],
                    search(),
                ),
                "parallel",
            ),
            group(
                ramped(
                    "parallel_deletes",
                    40,
                    3,
                    &[(10, 10), (30, 20), (20, 0)],
                    OperationKind::Delete,
                ),
                "parallel",
            ),
            group(
                ramped(
                    "stress",
                    120,
                    10,
                    &[(10, 300), (20, 500), (20, 500), (10, 0)],
                    OperationKind::MixedRead {
                        pagination_weight: 40,
                        gpu_weight: 35,
                        ram_weight: 25,
                        page_size: None,
                    },
                ),
                "stress",
            ),
        ],
        thresholds: thresholds(&[
            ("read_latency_ms", "p(95)<300"),
            ("read_latency_ms{group:stress}", "p(95)<500"),
            ("read_latency_ms{group:parallel}", "p(95)<200"),
            ("write_latency_ms", "p(95)<800"),
            ("write_latency_ms{group:warmup}", "p(95)<500"),
            ("search_latency_ms", "p(95)<600"),
            ("search_latency_ms{group:stress}", "p(95)<1000"),
            ("delete_latency_ms", "p(95)<800"),
            ("success_rate", "rate>0.97"),
            ("write_errors", "count<30"),
            ("http_req_failed", "rate<0.03"),
            ("http_req_duration", "p(99)<1500"),
        ]),
        ..RunConfig::default()
    }
}

fn exploratory() -> RunConfig {
    let mut contention = constant(
        "duplicate_contention",
        20,
        5,
        20,
        40,
        OperationKind::DuplicateProbe { pool_size: 10 },
    );
    contention.iterations_per_worker = Some(5);

    RunConfig {
        page_size: 20,
        phases: vec![
            group(
                ramped("warmup", 0, 3, &[(5, 80), (15, 80)], OperationKind::Write),
                "warmup",
            ),
            group(
                constant(
                    "replication_lag",
                    20,
                    5,
                    30,
                    60,
                    OperationKind::ReplicationProbe {
                        first_retry_ms: 50,
                        final_retry_ms: 200,
                    },
                ),
                "replication",
            ),
            group(contention, "contention"),
            group(
                constant(
                    "soak_reads",
                    20,
                    5,
                    60,
                    130,
                    OperationKind::SoakRead {
                        mid_from_secs: 43,
                        late_from_secs: 87,
                        page_size: Some(20),
                    },
                ),
                "soak",
            ),
            group(
                constant("soak_writes", 20, 3, 15, 130, OperationKind::Write),
                "soak",
            ),
            group(
                ramped(
                    "burst_recovery",
                    90,
                    5,
                    &[(5, 400), (15, 400), (5, 30), (35, 30)],
                    OperationKind::BurstRead {
                        burst_window_secs: 20,
                        page_size: Some(30),
                    },
                ),
                "burst",
            ),
            group(
                constant(
                    "large_pages",
                    30,
                    5,
                    40,
                    90,
                    OperationKind::PaginatedRead {
                        page_size: Some(100),
                        min_body_bytes: Some(10_000),
                    },
                ),
                "large_page",
            ),
        ],
        thresholds: thresholds(&[
            ("read_latency_ms", "p(95)<300"),
            ("read_latency_ms{group:soak}", "p(95)<250"),
            ("write_latency_ms", "p(95)<800"),
            ("replication_lag_rate", "rate<0.10"),
            ("soak_latency_late_ms", "p(95)<500"),
            ("recovery_phase_latency_ms", "p(95)<400"),
            ("success_rate", "rate>0.95"),
            ("write_errors", "count<50"),
            ("http_req_failed", "rate<0.05"),
            ("http_req_duration", "p(99)<2000"),
            ("duplicate_not_rejected", "count<1"),
        ]),
        ..RunConfig::default()
    }
}
