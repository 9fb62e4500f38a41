//! Worker loop
//!
//! A worker runs its phase's operation back to back until it is retired, its
//! iteration cap is reached, or the task is aborted by the phase driver.
//! Retirement is observed between iterations and during think time only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::http::ApiClient;
use crate::metrics::{names, MetricsRegistry, Tags};
use crate::operations::{Operation, OperationContext, WorkerState};

/// Random pause between iterations, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkTime {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl ThinkTime {
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let ms = if self.max_ms > self.min_ms {
            rng.gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        Duration::from_millis(ms)
    }
}

/// Everything the workers of one phase share
pub struct PhaseEnv {
    pub operation: Arc<dyn Operation>,
    pub client: Arc<dyn ApiClient>,
    pub metrics: Arc<MetricsRegistry>,
    pub tags: Tags,
    /// When the phase's first stage began
    pub started: Instant,
    pub request_timeout: Duration,
    pub run_id: Arc<str>,
    pub iterations_per_worker: Option<u64>,
    pub think_time: Option<ThinkTime>,
}

pub struct Worker {
    id: u64,
    env: Arc<PhaseEnv>,
    retire: CancellationToken,
    state: WorkerState,
    completed: Arc<AtomicU64>,
}

impl Worker {
    pub fn new(id: u64, env: Arc<PhaseEnv>, retire: CancellationToken) -> Self {
        Self::with_state(id, env, retire, WorkerState::new())
    }

    pub fn with_state(
        id: u64,
        env: Arc<PhaseEnv>,
        retire: CancellationToken,
        state: WorkerState,
    ) -> Self {
        Self {
            id,
            env,
            retire,
            state,
            completed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Completed-iteration count, readable after the task is aborted
    pub fn progress(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.completed)
    }

    fn exhausted(&self, completed: u64) -> bool {
        self.env
            .iterations_per_worker
            .is_some_and(|cap| completed >= cap)
    }

    /// Run until retired or out of iterations; returns completed iterations
    pub async fn run(mut self) -> u64 {
        let env = Arc::clone(&self.env);
        let mut completed = 0u64;

        while !self.retire.is_cancelled() && !self.exhausted(completed) {
            let ctx = OperationContext {
                client: env.client.as_ref(),
                metrics: env.metrics.as_ref(),
                tags: &env.tags,
                phase_elapsed: env.started.elapsed(),
                worker_id: self.id,
                iteration: completed,
                request_timeout: env.request_timeout,
                run_id: &env.run_id,
            };

            let start = Instant::now();
            let outcome = env.operation.execute(&ctx, &mut self.state).await;
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

            env.metrics.add(names::ITERATIONS, 1, &env.tags);
            env.metrics
                .trend(names::ITERATION_DURATION, duration_ms, &env.tags);
            completed += 1;
            self.completed.store(completed, Ordering::Relaxed);
            trace!(
                worker = self.id,
                operation = env.operation.name(),
                ?outcome,
                "Iteration {} took {:.1}ms",
                completed,
                duration_ms
            );

            if let Some(think) = env.think_time {
                let pause = think.sample(&mut self.state.rng);
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = self.retire.cancelled() => break,
                }
            }
        }

        completed
    }
}
