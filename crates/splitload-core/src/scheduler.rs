//! Scenario scheduler
//!
//! Each phase gets a driver task. Every tick the driver reads the phase's
//! [`Ramp`] and spawns or retires workers so the live population tracks the
//! target. Retired workers finish their current iteration; if they are still
//! running after the phase's grace period the driver aborts them and counts
//! the iteration as interrupted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::http::ApiClient;
use crate::metrics::{names, MetricsRegistry, Tags};
use crate::operations::{OperationKind, WorkerState};
use crate::ramp::Ramp;
use crate::worker::{PhaseEnv, ThinkTime, Worker};

/// One named traffic phase
#[derive(Debug, Clone)]
pub struct PhaseSpec {
    pub name: String,
    pub ramp: Ramp,
    /// How long retired workers may keep running before being aborted
    pub grace: Duration,
    pub operation: OperationKind,
    /// Extra tags on every sample, besides `phase`
    pub tags: Tags,
    pub iterations_per_worker: Option<u64>,
    pub think_time: Option<ThinkTime>,
}

impl PhaseSpec {
    pub fn new(name: impl Into<String>, ramp: Ramp, operation: OperationKind) -> Self {
        Self {
            name: name.into(),
            ramp,
            grace: Duration::from_secs(30),
            operation,
            tags: Tags::new(),
            iterations_per_worker: None,
            think_time: None,
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key, value);
        self
    }

    pub fn iterations_per_worker(mut self, cap: u64) -> Self {
        self.iterations_per_worker = Some(cap);
        self
    }

    pub fn think_time(mut self, think: ThinkTime) -> Self {
        self.think_time = Some(think);
        self
    }

    /// Phase tags as applied to samples
    pub fn sample_tags(&self) -> Tags {
        self.tags.with("phase", self.name.as_str())
    }
}

/// Scheduler settings shared by every phase
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often drivers re-read their ramp
    pub tick: Duration,
    pub request_timeout: Duration,
    pub default_page_size: u32,
    /// Interval of the progress log line, `None` disables it
    pub progress_interval: Option<Duration>,
    pub run_id: String,
    /// Seed for per-worker random state
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
            default_page_size: 50,
            progress_interval: Some(Duration::from_secs(10)),
            run_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            seed: None,
        }
    }
}

/// What one phase did
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseSummary {
    pub name: String,
    pub operation: String,
    pub workers_spawned: u64,
    pub peak_workers: usize,
    pub iterations: u64,
    pub interrupted: u64,
    pub elapsed_secs: f64,
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub phases: Vec<PhaseSummary>,
    /// Stop was requested before every phase ended
    pub stopped_early: bool,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct Scheduler {
    phases: Vec<PhaseSpec>,
    client: Arc<dyn ApiClient>,
    metrics: Arc<MetricsRegistry>,
    config: SchedulerConfig,
    stop: CancellationToken,
    active: Vec<Arc<AtomicUsize>>,
}

impl Scheduler {
    pub fn new(
        phases: Vec<PhaseSpec>,
        client: Arc<dyn ApiClient>,
        metrics: Arc<MetricsRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let active = phases
            .iter()
            .map(|_| Arc::new(AtomicUsize::new(0)))
            .collect();
        Self {
            phases,
            client,
            metrics,
            config,
            stop: CancellationToken::new(),
            active,
        }
    }

    /// Cancelling this retires every worker (with grace) and ends the run
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Live worker count per phase
    pub fn active_workers(&self) -> Vec<(String, Arc<AtomicUsize>)> {
        self.phases
            .iter()
            .zip(&self.active)
            .map(|(phase, count)| (phase.name.clone(), Arc::clone(count)))
            .collect()
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    /// Latest point at which a phase's stages end
    pub fn planned_duration(&self) -> Duration {
        self.phases
            .iter()
            .map(|p| p.ramp.end())
            .max()
            .unwrap_or_default()
    }

    pub async fn run(self) -> RunOutcome {
        let started_at = Utc::now();
        let run_start = Instant::now();
        let run_id: Arc<str> = Arc::from(self.config.run_id.as_str());
        let next_worker_id = Arc::new(AtomicU64::new(0));

        info!(
            run_id = %run_id,
            phases = self.phases.len(),
            "Starting run, planned duration {:?}",
            self.planned_duration()
        );

        let progress_done = CancellationToken::new();
        let progress = self.config.progress_interval.map(|every| {
            tokio::spawn(log_progress(
                every,
                self.active_workers(),
                Arc::clone(&self.metrics),
                progress_done.clone(),
            ))
        });

        let mut drivers = Vec::with_capacity(self.phases.len());
        for (spec, active) in self.phases.iter().zip(&self.active) {
            let template = EnvTemplate {
                operation: spec.operation.build(self.config.default_page_size),
                client: Arc::clone(&self.client),
                metrics: Arc::clone(&self.metrics),
                tags: spec.sample_tags(),
                request_timeout: self.config.request_timeout,
                run_id: Arc::clone(&run_id),
                iterations_per_worker: spec.iterations_per_worker,
                think_time: spec.think_time,
            };
            let driver = PhaseDriver {
                operation_label: spec.operation.label(),
                name: spec.name.clone(),
                ramp: spec.ramp.clone(),
                grace: spec.grace,
                tick: self.config.tick,
                seed: self.config.seed,
                active: Arc::clone(active),
                next_worker_id: Arc::clone(&next_worker_id),
                stop: self.stop.clone(),
            };
            drivers.push(tokio::spawn(driver.run(template, run_start)));
        }

        let mut phases = Vec::with_capacity(drivers.len());
        for (result, spec) in join_all(drivers).await.into_iter().zip(&self.phases) {
            match result {
                Ok(summary) => phases.push(summary),
                Err(e) => {
                    error!(phase = %spec.name, "Phase driver failed: {}", e);
                    phases.push(PhaseSummary {
                        name: spec.name.clone(),
                        operation: spec.operation.label().to_string(),
                        ..Default::default()
                    });
                }
            }
        }

        progress_done.cancel();
        if let Some(handle) = progress {
            let _ = handle.await;
        }

        let elapsed = run_start.elapsed();
        info!(run_id = %run_id, "Run finished after {:.1}s", elapsed.as_secs_f64());
        RunOutcome {
            run_id: run_id.to_string(),
            started_at,
            elapsed_secs: elapsed.as_secs_f64(),
            phases,
            stopped_early: self.stop.is_cancelled(),
        }
    }
}

async fn log_progress(
    every: Duration,
    active: Vec<(String, Arc<AtomicUsize>)>,
    metrics: Arc<MetricsRegistry>,
    done: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = done.cancelled() => break,
        }
        let workers: Vec<String> = active
            .iter()
            .map(|(name, count)| format!("{}={}", name, count.load(Ordering::Relaxed)))
            .collect();
        info!(
            iterations = metrics.counter_total(names::ITERATIONS),
            http_reqs = metrics.counter_total(names::HTTP_REQS),
            "Active workers: {}",
            workers.join(" ")
        );
    }
}

// ============================================================================
// PHASE DRIVER
// ============================================================================

/// [`PhaseEnv`] minus the start instant, known only once the phase begins
struct EnvTemplate {
    operation: Arc<dyn crate::operations::Operation>,
    client: Arc<dyn ApiClient>,
    metrics: Arc<MetricsRegistry>,
    tags: Tags,
    request_timeout: Duration,
    run_id: Arc<str>,
    iterations_per_worker: Option<u64>,
    think_time: Option<ThinkTime>,
}

impl EnvTemplate {
    fn start(self, started: Instant) -> PhaseEnv {
        PhaseEnv {
            operation: self.operation,
            client: self.client,
            metrics: self.metrics,
            tags: self.tags,
            started,
            request_timeout: self.request_timeout,
            run_id: self.run_id,
            iterations_per_worker: self.iterations_per_worker,
            think_time: self.think_time,
        }
    }
}

struct Slot {
    id: u64,
    retire: CancellationToken,
    handle: JoinHandle<u64>,
    progress: Arc<AtomicU64>,
}

struct Retiring {
    id: u64,
    deadline: Instant,
    handle: JoinHandle<u64>,
    progress: Arc<AtomicU64>,
}

struct PhaseDriver {
    name: String,
    operation_label: &'static str,
    ramp: Ramp,
    grace: Duration,
    tick: Duration,
    seed: Option<u64>,
    active: Arc<AtomicUsize>,
    next_worker_id: Arc<AtomicU64>,
    stop: CancellationToken,
}

impl PhaseDriver {
    async fn run(self, template: EnvTemplate, run_start: Instant) -> PhaseSummary {
        let mut summary = PhaseSummary {
            name: self.name.clone(),
            operation: self.operation_label.to_string(),
            ..Default::default()
        };

        tokio::select! {
            _ = tokio::time::sleep_until(run_start + self.ramp.start_offset()) => {}
            _ = self.stop.cancelled() => {
                debug!(phase = %self.name, "Stopped before start");
                return summary;
            }
        }

        let phase_start = Instant::now();
        let env = Arc::new(template.start(phase_start));
        let capped = env.iterations_per_worker.is_some();
        info!(
            phase = %self.name,
            operation = self.operation_label,
            peak = self.ramp.peak(),
            "Phase started"
        );

        let mut live: Vec<Slot> = Vec::new();
        let mut retiring: Vec<Retiring> = Vec::new();
        let mut exhausted: usize = 0;

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.stop.cancelled(), if !self.stop.is_cancelled() => {}
            }
            let now = Instant::now();
            let elapsed = now.duration_since(run_start);

            // Workers that ended on their own. Only a capped worker that ran
            // to completion keeps its slot filled; anything else is respawned.
            live.retain_mut(|slot| match (&mut slot.handle).now_or_never() {
                None => true,
                Some(result) => {
                    summary.iterations += slot.progress.load(Ordering::Relaxed);
                    match result {
                        Ok(_) if capped => exhausted += 1,
                        Ok(_) => debug!(phase = %self.name, worker = slot.id, "Worker exited early"),
                        Err(e) => error!(
                            phase = %self.name,
                            worker = slot.id,
                            "Worker task failed, respawning: {}",
                            e
                        ),
                    }
                    false
                }
            });

            // Retired workers: collect, or abort once past their deadline
            retiring.retain_mut(|r| {
                if (&mut r.handle).now_or_never().is_some() {
                    summary.iterations += r.progress.load(Ordering::Relaxed);
                    return false;
                }
                if now >= r.deadline {
                    r.handle.abort();
                    summary.iterations += r.progress.load(Ordering::Relaxed);
                    summary.interrupted += 1;
                    env.metrics.add(names::INTERRUPTED_ITERATIONS, 1, &env.tags);
                    warn!(
                        phase = %self.name,
                        worker = r.id,
                        "Worker exceeded {:?} grace, aborted",
                        self.grace
                    );
                    return false;
                }
                true
            });

            let all_exhausted =
                capped && live.is_empty() && exhausted >= self.ramp.peak() as usize;
            let ending = self.stop.is_cancelled() || elapsed >= self.ramp.end() || all_exhausted;
            let target = if ending {
                0
            } else {
                self.ramp.population_at(elapsed) as usize
            };
            let occupied = live.len() + exhausted;

            if occupied < target {
                for _ in occupied..target {
                    live.push(self.spawn(&env));
                    summary.workers_spawned += 1;
                }
            } else if occupied > target {
                // Newest first
                let excess = (occupied - target).min(live.len());
                for slot in live.drain(live.len() - excess..).rev() {
                    slot.retire.cancel();
                    retiring.push(Retiring {
                        id: slot.id,
                        deadline: now + self.grace,
                        handle: slot.handle,
                        progress: slot.progress,
                    });
                }
            }

            self.active.store(live.len(), Ordering::Relaxed);
            summary.peak_workers = summary.peak_workers.max(live.len());

            if ending && live.is_empty() && retiring.is_empty() {
                break;
            }
        }

        summary.elapsed_secs = phase_start.elapsed().as_secs_f64();
        info!(
            phase = %self.name,
            iterations = summary.iterations,
            interrupted = summary.interrupted,
            "Phase finished after {:.1}s",
            summary.elapsed_secs
        );
        summary
    }

    fn spawn(&self, env: &Arc<PhaseEnv>) -> Slot {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let retire = CancellationToken::new();
        let state = match self.seed {
            Some(seed) => WorkerState::seeded(seed ^ id),
            None => WorkerState::new(),
        };
        let worker = Worker::with_state(id, Arc::clone(env), retire.clone(), state);
        let progress = worker.progress();
        Slot {
            id,
            retire,
            handle: tokio::spawn(worker.run()),
            progress,
        }
    }
}
