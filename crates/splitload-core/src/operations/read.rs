use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use super::search::{Search, SearchKind};
use super::{Operation, OperationContext, Outcome, WorkerState};
use crate::cursor::PageStep;
use crate::http::computer;
use crate::metrics::names;
use crate::validation;

/// Extra latency series keyed on time since phase start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyBuckets {
    None,
    /// `burst_phase_latency_ms` inside the window, `recovery_phase_latency_ms` after
    Burst { window: Duration },
    /// `soak_latency_{early,mid,late}_ms`
    Soak { mid_from: Duration, late_from: Duration },
}

impl LatencyBuckets {
    /// Metric the observation lands in, if any
    pub fn metric_for(&self, phase_elapsed: Duration) -> Option<&'static str> {
        match *self {
            Self::None => None,
            Self::Burst { window } if phase_elapsed < window => Some(names::BURST_LATENCY),
            Self::Burst { .. } => Some(names::RECOVERY_LATENCY),
            Self::Soak { late_from, .. } if phase_elapsed >= late_from => {
                Some(names::SOAK_LATE_LATENCY)
            }
            Self::Soak { mid_from, .. } if phase_elapsed >= mid_from => {
                Some(names::SOAK_MID_LATENCY)
            }
            Self::Soak { .. } => Some(names::SOAK_EARLY_LATENCY),
        }
    }
}

/// Keyset-paginated read over `/computer/pagination`
#[derive(Debug, Clone)]
pub struct PaginatedRead {
    pub page_size: u32,
    /// Non-empty pages smaller than this count as failed reads
    pub min_body_bytes: Option<usize>,
    pub buckets: LatencyBuckets,
}

impl PaginatedRead {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            min_body_bytes: None,
            buckets: LatencyBuckets::None,
        }
    }

    async fn read_page(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let request = computer::paginate(state.traversal.cursor(), self.page_size);
        let exchange = ctx.send("pagination", request, |s| s == 200).await;
        ctx.metrics
            .trend(names::READ_LATENCY, exchange.latency_ms, &exchange.tags);
        if let Some(metric) = self.buckets.metric_for(ctx.phase_elapsed) {
            ctx.metrics.trend(metric, exchange.latency_ms, &exchange.tags);
        }

        let outcome = match exchange.response() {
            None => {
                state.traversal.reset();
                Outcome::TransportFailure
            }
            Some(response) => {
                let check = validation::json_array(response);
                match check.payload {
                    Some(items) if check.status_ok => {
                        let small = self
                            .min_body_bytes
                            .is_some_and(|min| !items.is_empty() && response.body.len() < min);
                        match state.traversal.advance(&items) {
                            PageStep::Wrapped => {
                                ctx.metrics.add(names::EMPTY_PAGE_TOTAL, 1, &exchange.tags);
                                Outcome::Passed
                            }
                            PageStep::Malformed => {
                                debug!(worker = ctx.worker_id, "Last item carries no cursor");
                                Outcome::ProtocolFailure
                            }
                            PageStep::Regressed => {
                                warn!(
                                    worker = ctx.worker_id,
                                    pass = state.traversal.pass(),
                                    "Cursor did not advance past previous page"
                                );
                                ctx.metrics
                                    .add(names::CURSOR_REGRESSIONS, 1, &exchange.tags);
                                Outcome::Finding
                            }
                            PageStep::Advanced if small => {
                                ctx.metrics.add(names::SMALL_PAGE_TOTAL, 1, &exchange.tags);
                                state.traversal.reset();
                                Outcome::ProtocolFailure
                            }
                            PageStep::Advanced => Outcome::Passed,
                        }
                    }
                    _ => {
                        debug!(
                            worker = ctx.worker_id,
                            status = response.status,
                            "Page read failed: {}",
                            check.failure_reason().unwrap_or("unknown")
                        );
                        state.traversal.reset();
                        Outcome::ProtocolFailure
                    }
                }
            }
        };

        // Regressions are findings, the read itself succeeded
        let ok = matches!(outcome, Outcome::Passed | Outcome::Finding);
        if !ok {
            ctx.metrics.add(names::READ_ERRORS, 1, &exchange.tags);
        }
        ctx.success(ok, &exchange.tags);
        outcome
    }
}

#[async_trait]
impl Operation for PaginatedRead {
    fn name(&self) -> &'static str {
        match self.buckets {
            LatencyBuckets::None => "paginated_read",
            LatencyBuckets::Burst { .. } => "burst_read",
            LatencyBuckets::Soak { .. } => "soak_read",
        }
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        self.read_page(ctx, state).await
    }
}

/// Weighted mix of pagination, GPU search and RAM search
#[derive(Debug, Clone)]
pub struct MixedRead {
    pub page_size: u32,
    pub pagination_weight: u32,
    pub gpu_weight: u32,
    pub ram_weight: u32,
    pub search: Search,
}

impl MixedRead {
    fn total_weight(&self) -> u32 {
        self.pagination_weight + self.gpu_weight + self.ram_weight
    }
}

#[async_trait]
impl Operation for MixedRead {
    fn name(&self) -> &'static str {
        "mixed_read"
    }

    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome {
        let total = self.total_weight();
        let roll = if total == 0 {
            0
        } else {
            state.rng.gen_range(0..total)
        };

        if roll < self.pagination_weight || total == 0 {
            PaginatedRead::new(self.page_size).read_page(ctx, state).await
        } else if roll < self.pagination_weight + self.gpu_weight {
            self.search.run(ctx, state, SearchKind::Gpu).await
        } else {
            self.search.run(ctx, state, SearchKind::Ram).await
        }
    }
}
