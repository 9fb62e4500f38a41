use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use super::{Operation, OperationContext, Outcome, WorkerState};
use crate::http::computer;
use crate::metrics::names;
use crate::payload::RAM_CAPACITIES_GB;
use crate::validation;

const GPU_TERMS: &[&str] = &[
    "RTX", "GTX", "RX", "Arc", "4090", "4080", "4070", "3090", "3060", "7900", "7800", "SUPER",
    "Ti", "GAMING",
];

pub(crate) fn default_gpu_terms() -> Vec<String> {
    GPU_TERMS.iter().map(|t| t.to_string()).collect()
}

pub(crate) fn default_ram_capacities() -> Vec<u32> {
    RAM_CAPACITIES_GB.to_vec()
}

/// Which index a search hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchKind {
    Gpu,
    Ram,
}

/// Search by GPU substring or RAM capacity, 50/50
#[derive(Debug, Clone)]
pub struct Search {
    gpu_terms: Vec<String>,
    ram_capacities: Vec<u32>,
}

impl Search {
    /// Empty pools fall back to the built-in ones
    pub fn new(gpu_terms: Vec<String>, ram_capacities: Vec<u32>) -> Self {
        Self {
            gpu_terms: if gpu_terms.is_empty() {
                default_gpu_terms()
            } else {
                gpu_terms
            },
            ram_capacities: if ram_capacities.is_empty() {
                default_ram_capacities()
            } else {
                ram_capacities
            },
        }
    }

    pub(crate) async fn run(
        &self,
        ctx: &OperationContext<'_>,
        state: &mut WorkerState,
        kind: SearchKind,
    ) -> Outcome {
        let (operation, request, total) = match kind {
            SearchKind::Gpu => {
                let term = self
                    .gpu_terms
                    .choose(&mut state.rng)
                    .map(String::as_str)
                    .unwrap_or("RTX");
                ("search_gpu", computer::search_gpu(term), names::SEARCH_GPU_TOTAL)
            }
            SearchKind::Ram => {
                let capacity = self
                    .ram_capacities
                    .choose(&mut state.rng)
                    .copied()
                    .unwrap_or(32);
                ("search_ram", computer::search_ram(capacity), names::SEARCH_RAM_TOTAL)
            }
        };

        let exchange = ctx.send(operation, request, |s| s == 200).await;
        ctx.metrics
            .trend(names::SEARCH_LATENCY, exchange.latency_ms, &exchange.tags);

        let outcome = match exchange.response() {
            None => Outcome::TransportFailure,
            Some(response) => {
                let check = validation::json_array(response);
                if check.passed() {
                    Outcome::Passed
                } else {
                    debug!(
                        worker = ctx.worker_id,
                        status = response.status,
                        "Search failed: {}",
                        check.failure_reason().unwrap_or("unknown")
                    );
                    Outcome::ProtocolFailure
                }
            }
        };

        if outcome.is_passed() {
            ctx.metrics.add(total, 1, &exchange.tags);
        } else {
            ctx.metrics.add(names::SEARCH_ERRORS, 1, &exchange.tags);
        }
        ctx.success(outcome.is_passed(), &exchange.tags);
        outcome
    }
}

impl Default for Search {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl Operation for Search {
    fn name(&self) -> &'static str {
        "search"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let kind = if state.rng.gen_bool(0.5) {
            SearchKind::Gpu
        } else {
            SearchKind::Ram
        };
        self.run(ctx, state, kind).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::testing::*;
    use super::*;
    use crate::metrics::{MetricsRegistry, Tags};

    #[tokio::test]
    async fn test_search_uses_configured_pools() {
        let responses = (0..40).map(|_| ScriptedClient::ok(200, "[]")).collect();
        let client = ScriptedClient::new(responses);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        let ctx = context(&client, &metrics, &tags, Duration::ZERO);
        let mut state = WorkerState::seeded(11);
        let search = Search::new(vec!["RTX 4090".into()], vec![64]);

        for _ in 0..40 {
            assert_eq!(search.execute(&ctx, &mut state).await, Outcome::Passed);
        }

        let paths: Vec<String> = client.sent().iter().map(|r| r.path()).collect();
        assert!(paths.iter().all(|p| {
            p == "/computer/search/gpu/RTX 4090" || p == "/computer/search/ram/64"
        }));
        let gpu = metrics.counter_total(names::SEARCH_GPU_TOTAL);
        let ram = metrics.counter_total(names::SEARCH_RAM_TOTAL);
        assert_eq!(gpu + ram, 40);
        assert!(gpu > 0 && ram > 0);
    }

    #[tokio::test]
    async fn test_search_requires_array() {
        let client = ScriptedClient::new(vec![ScriptedClient::ok(200, r#"{"error":"x"}"#)]);
        let metrics = MetricsRegistry::new();
        let tags = Tags::new();
        let ctx = context(&client, &metrics, &tags, Duration::ZERO);
        let mut state = WorkerState::seeded(12);

        let outcome = Search::default().run(&ctx, &mut state, SearchKind::Ram).await;
        assert_eq!(outcome, Outcome::ProtocolFailure);
        assert_eq!(metrics.counter_total(names::SEARCH_ERRORS), 1);
    }
}
