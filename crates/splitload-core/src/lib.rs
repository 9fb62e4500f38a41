//! # splitload
//!
//! Phased load generation and consistency probing for a primary/replica
//! "computer" inventory service.
//!
//! ## Features
//!
//! - **Ramped phases**: piecewise-linear worker populations, overlapping in time
//! - **Operation executors**: writes, cursor pagination, searches, deletes
//! - **Consistency probes**: replication lag, duplicate-key contention,
//!   cursor regressions
//! - **Metrics**: tagged counters, rates and HDR latency trends
//! - **Thresholds**: `p(95)<500`-style rules over tag-filtered series
//! - **Reports**: console, JSON and Prometheus text sinks
//!
//! ## Usage
//!
//! ```bash
//! # Run a built-in scenario
//! splitload preset exploratory --target http://localhost:8080
//!
//! # Run a scenario file
//! splitload run --config scenario.toml --output report.json
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod http;
pub mod metrics;
pub mod operations;
pub mod payload;
pub mod presets;
pub mod ramp;
pub mod report;
pub mod scheduler;
pub mod threshold;
pub mod validation;
pub mod worker;

pub use config::{PhaseConfig, RunConfig};
pub use error::{LoadError, Result, TransportError};
pub use http::{ApiClient, ApiRequest, ApiResponse, HttpApiClient};
pub use metrics::{MetricsRegistry, Tags};
pub use operations::{Operation, OperationKind, Outcome};
pub use ramp::{Ramp, Stage};
pub use report::{ConsoleSink, JsonFileSink, PrometheusSink, ReportSink, RunReport};
pub use scheduler::{PhaseSpec, RunOutcome, Scheduler, SchedulerConfig};
pub use threshold::{ThresholdRule, Verdict};
