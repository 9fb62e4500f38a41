//! Operation executors
//!
//! An operation is one iteration's worth of protocol: it issues one or more
//! requests through the [`ApiClient`], classifies the responses with
//! [`crate::validation`], updates the worker's private [`WorkerState`] and
//! emits samples to the shared [`MetricsRegistry`].

mod delete;
mod duplicate;
mod read;
mod replication;
mod search;
mod write;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::cursor::Traversal;
use crate::error::TransportError;
use crate::http::{ApiClient, ApiRequest, ApiResponse};
use crate::metrics::{names, MetricsRegistry, Tags};

pub use delete::Delete;
pub use duplicate::DuplicateProbe;
pub use read::{LatencyBuckets, MixedRead, PaginatedRead};
pub use replication::ReplicationProbe;
pub use search::Search;
pub use write::{Write, WriteCleanup};

/// Names remembered per worker for later deletes
pub const RECENT_NAMES_CAPACITY: usize = 200;

// ============================================================================
// OPERATION TRAIT
// ============================================================================

/// How an iteration ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every check passed
    Passed,
    /// Transport failed (timeout, refused, reset)
    TransportFailure,
    /// Service answered with an unexpected status or body
    ProtocolFailure,
    /// Service answered but misbehaved (lag, duplicate accepted, cursor regression)
    Finding,
}

impl Outcome {
    pub fn is_passed(self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// One traffic type
#[async_trait]
pub trait Operation: Send + Sync {
    /// Operation name, used in logs
    fn name(&self) -> &'static str;

    /// Run a single iteration
    async fn execute(&self, ctx: &OperationContext<'_>, state: &mut WorkerState) -> Outcome;
}

// ============================================================================
// WORKER STATE
// ============================================================================

/// Bounded FIFO of record names this worker created
#[derive(Debug, Clone)]
pub struct RecentNames {
    names: VecDeque<String>,
    capacity: usize,
}

impl RecentNames {
    pub fn new(capacity: usize) -> Self {
        Self {
            names: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, name: String) {
        if self.capacity == 0 {
            return;
        }
        if self.names.len() == self.capacity {
            self.names.pop_front();
        }
        self.names.push_back(name);
    }

    /// Remove and return a random remembered name
    pub fn take_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<String> {
        if self.names.is_empty() {
            return None;
        }
        let idx = rng.gen_range(0..self.names.len());
        self.names.remove(idx)
    }

    /// Forget `name` if remembered
    pub fn take_named(&mut self, name: &str) -> Option<String> {
        let idx = self.names.iter().position(|n| n == name)?;
        self.names.remove(idx)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// State owned by exactly one worker and never shared
#[derive(Debug)]
pub struct WorkerState {
    pub traversal: Traversal,
    pub written: RecentNames,
    pub rng: StdRng,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic state for reproducible runs and tests
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            traversal: Traversal::new(),
            written: RecentNames::new(RECENT_NAMES_CAPACITY),
            rng,
        }
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// Everything an operation needs besides its worker's private state
pub struct OperationContext<'a> {
    pub client: &'a dyn ApiClient,
    pub metrics: &'a MetricsRegistry,
    /// Phase tags, applied to every sample
    pub tags: &'a Tags,
    /// Wall-clock time since the owning phase started
    pub phase_elapsed: Duration,
    pub worker_id: u64,
    pub iteration: u64,
    pub request_timeout: Duration,
    /// Identifier unique to this run, used to namespace generated keys
    pub run_id: &'a str,
}

/// Result of one request plus what was recorded about it
pub struct Exchange {
    pub result: Result<ApiResponse, TransportError>,
    pub latency_ms: f64,
    /// Phase tags plus `operation`
    pub tags: Tags,
}

impl Exchange {
    pub fn response(&self) -> Option<&ApiResponse> {
        self.result.as_ref().ok()
    }

    pub fn is_transport_failure(&self) -> bool {
        self.result.is_err()
    }
}

impl<'a> OperationContext<'a> {
    /// Send `request` and record the built-in HTTP metrics.
    ///
    /// `expected` decides which statuses count as a non-failed request for
    /// `http_req_failed`.
    pub async fn send(
        &self,
        operation: &str,
        request: ApiRequest,
        expected: fn(u16) -> bool,
    ) -> Exchange {
        let request = match request.timeout {
            Some(_) => request,
            None => request.timeout(self.request_timeout),
        };
        let tags = self.tags.with("operation", operation);

        let start = Instant::now();
        let result = self.client.send(request).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        self.metrics.add(names::HTTP_REQS, 1, &tags);
        self.metrics.trend(names::HTTP_REQ_DURATION, latency_ms, &tags);
        let failed = match &result {
            Ok(response) => !expected(response.status),
            Err(err) => {
                self.metrics
                    .add(names::TRANSPORT_ERRORS, 1, &tags.with("kind", err.kind()));
                debug!(
                    worker = self.worker_id,
                    operation,
                    "Transport failure after {:.1}ms: {}",
                    latency_ms,
                    err
                );
                true
            }
        };
        self.metrics.rate(names::HTTP_REQ_FAILED, failed, &tags);

        Exchange {
            result,
            latency_ms,
            tags,
        }
    }

    /// Record a success-rate observation under the phase tags
    pub fn success(&self, ok: bool, tags: &Tags) {
        self.metrics.rate(names::SUCCESS_RATE, ok, tags);
    }
}

// ============================================================================
// OPERATION SELECTION
// ============================================================================

fn default_settle_ms() -> u64 {
    1000
}

fn default_first_retry_ms() -> u64 {
    50
}

fn default_final_retry_ms() -> u64 {
    200
}

fn default_pool_size() -> usize {
    10
}

fn default_pagination_weight() -> u32 {
    40
}

fn default_gpu_weight() -> u32 {
    35
}

fn default_ram_weight() -> u32 {
    25
}

/// Closed set of traffic types a phase can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationKind {
    /// `POST /computer`
    Write,
    /// Write, wait, delete the written record
    WriteCleanup {
        #[serde(default = "default_settle_ms")]
        settle_ms: u64,
    },
    /// Keyset pagination over the replica
    PaginatedRead {
        #[serde(default)]
        page_size: Option<u32>,
        #[serde(default)]
        min_body_bytes: Option<usize>,
    },
    /// GPU substring or RAM capacity search
    Search {
        #[serde(default = "search::default_gpu_terms")]
        gpu_terms: Vec<String>,
        #[serde(default = "search::default_ram_capacities")]
        ram_capacities: Vec<u32>,
    },
    /// `DELETE /computer/{name}` of a previously written name
    Delete,
    /// Write to primary, read back from replica
    ReplicationProbe {
        #[serde(default = "default_first_retry_ms")]
        first_retry_ms: u64,
        #[serde(default = "default_final_retry_ms")]
        final_retry_ms: u64,
    },
    /// Inserts colliding on a small pool of unique names
    DuplicateProbe {
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
    /// Paginated read bucketed into burst / recovery by phase time
    BurstRead {
        burst_window_secs: u64,
        #[serde(default)]
        page_size: Option<u32>,
    },
    /// Paginated read bucketed into early / mid / late by phase time
    SoakRead {
        mid_from_secs: u64,
        late_from_secs: u64,
        #[serde(default)]
        page_size: Option<u32>,
    },
    /// Weighted mix of pagination, GPU search and RAM search
    MixedRead {
        #[serde(default = "default_pagination_weight")]
        pagination_weight: u32,
        #[serde(default = "default_gpu_weight")]
        gpu_weight: u32,
        #[serde(default = "default_ram_weight")]
        ram_weight: u32,
        #[serde(default)]
        page_size: Option<u32>,
    },
}

impl OperationKind {
    /// Stable label for logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::WriteCleanup { .. } => "write_cleanup",
            Self::PaginatedRead { .. } => "paginated_read",
            Self::Search { .. } => "search",
            Self::Delete => "delete",
            Self::ReplicationProbe { .. } => "replication_probe",
            Self::DuplicateProbe { .. } => "duplicate_probe",
            Self::BurstRead { .. } => "burst_read",
            Self::SoakRead { .. } => "soak_read",
            Self::MixedRead { .. } => "mixed_read",
        }
    }

    /// Instantiate the executor; `default_page_size` fills unset page sizes
    pub fn build(&self, default_page_size: u32) -> Arc<dyn Operation> {
        let page = |size: &Option<u32>| size.unwrap_or(default_page_size);
        match self {
            Self::Write => Arc::new(Write),
            Self::WriteCleanup { settle_ms } => Arc::new(WriteCleanup {
                settle: Duration::from_millis(*settle_ms),
            }),
            Self::PaginatedRead {
                page_size,
                min_body_bytes,
            } => Arc::new(PaginatedRead {
                page_size: page(page_size),
                min_body_bytes: *min_body_bytes,
                buckets: LatencyBuckets::None,
            }),
            Self::Search {
                gpu_terms,
                ram_capacities,
            } => Arc::new(Search::new(gpu_terms.clone(), ram_capacities.clone())),
            Self::Delete => Arc::new(Delete),
            Self::ReplicationProbe {
                first_retry_ms,
                final_retry_ms,
            } => Arc::new(ReplicationProbe {
                first_retry: Duration::from_millis(*first_retry_ms),
                final_retry: Duration::from_millis(*final_retry_ms),
            }),
            Self::DuplicateProbe { pool_size } => Arc::new(DuplicateProbe {
                pool_size: (*pool_size).max(1),
            }),
            Self::BurstRead {
                burst_window_secs,
                page_size,
            } => Arc::new(PaginatedRead {
                page_size: page(page_size),
                min_body_bytes: None,
                buckets: LatencyBuckets::Burst {
                    window: Duration::from_secs(*burst_window_secs),
                },
            }),
            Self::SoakRead {
                mid_from_secs,
                late_from_secs,
                page_size,
            } => Arc::new(PaginatedRead {
                page_size: page(page_size),
                min_body_bytes: None,
                buckets: LatencyBuckets::Soak {
                    mid_from: Duration::from_secs(*mid_from_secs),
                    late_from: Duration::from_secs(*late_from_secs),
                },
            }),
            Self::MixedRead {
                pagination_weight,
                gpu_weight,
                ram_weight,
                page_size,
            } => Arc::new(MixedRead {
                page_size: page(page_size),
                pagination_weight: *pagination_weight,
                gpu_weight: *gpu_weight,
                ram_weight: *ram_weight,
                search: Search::default(),
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted client for operation unit tests

    use super::*;
    use parking_lot::Mutex;

    pub struct ScriptedClient {
        responses: Mutex<VecDeque<Result<ApiResponse, TransportError>>>,
        pub requests: Mutex<Vec<ApiRequest>>,
    }

    impl ScriptedClient {
        pub fn new(responses: Vec<Result<ApiResponse, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn ok(status: u16, body: &str) -> Result<ApiResponse, TransportError> {
            Ok(ApiResponse::new(status, body))
        }

        pub fn sent(&self) -> Vec<ApiRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ApiClient for ScriptedClient {
        async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
        }
    }

    pub fn context<'a>(
        client: &'a ScriptedClient,
        metrics: &'a MetricsRegistry,
        tags: &'a Tags,
        phase_elapsed: Duration,
    ) -> OperationContext<'a> {
        OperationContext {
            client,
            metrics,
            tags,
            phase_elapsed,
            worker_id: 1,
            iteration: 0,
            request_timeout: Duration::from_secs(10),
            run_id: "test",
        }
    }
}
