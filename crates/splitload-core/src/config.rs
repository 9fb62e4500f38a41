//! Run configuration
//!
//! A run is described by a TOML document:
//!
//! ```toml
//! base_url = "http://localhost:8080"
//! page_size = 50
//!
//! [[phases]]
//! name = "writes"
//! stages = [{ duration_secs = 30, target = 20 }, { duration_secs = 60, target = 20 }]
//! tags = { group = "warmup" }
//! operation = { kind = "write" }
//!
//! [thresholds]
//! "success_rate{group:warmup}" = ["rate>0.95"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};
use crate::operations::OperationKind;
use crate::ramp::{Ramp, Stage};
use crate::scheduler::{PhaseSpec, SchedulerConfig};
use crate::threshold::ThresholdRule;
use crate::worker::ThinkTime;

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_page_size() -> u32 {
    50
}

fn default_tick_ms() -> u64 {
    100
}

fn default_progress_interval_secs() -> u64 {
    10
}

fn default_max_idle_per_host() -> usize {
    100
}

fn default_grace_secs() -> u64 {
    30
}

fn default_console() -> bool {
    true
}

/// Complete run configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    /// Target service base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Page size for reads that don't set their own
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Scheduler tick
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    /// Progress log interval, 0 disables
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,

    /// Idle connections kept per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,

    /// Seed for reproducible worker randomness
    #[serde(default)]
    pub seed: Option<u64>,

    /// Traffic phases, run concurrently
    #[serde(default)]
    pub phases: Vec<PhaseConfig>,

    /// `selector -> [predicate, ...]`
    #[serde(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,

    /// Report destinations
    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
            tick_ms: default_tick_ms(),
            progress_interval_secs: default_progress_interval_secs(),
            max_idle_per_host: default_max_idle_per_host(),
            seed: None,
            phases: Vec::new(),
            thresholds: BTreeMap::new(),
            output: OutputConfig::default(),
        }
    }
}

/// One phase as written in the config file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,

    /// Seconds after run start at which the first stage begins
    #[serde(default)]
    pub start_secs: u64,

    /// Ramp stages; alternatively `workers` + `duration_secs` for a flat phase
    #[serde(default)]
    pub stages: Vec<Stage>,

    #[serde(default)]
    pub workers: Option<u32>,

    #[serde(default)]
    pub duration_secs: Option<u64>,

    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    #[serde(default)]
    pub iterations_per_worker: Option<u64>,

    #[serde(default)]
    pub think_time: Option<ThinkTime>,

    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    pub operation: OperationKind,
}

impl PhaseConfig {
    fn ramp(&self) -> Result<Ramp> {
        let start = Duration::from_secs(self.start_secs);
        match (self.stages.is_empty(), self.workers, self.duration_secs) {
            (false, None, None) => Ok(Ramp::new(start, self.stages.clone())),
            (true, Some(workers), Some(duration)) => Ok(Ramp::constant(start, workers, duration)),
            _ => Err(LoadError::InvalidConfig(format!(
                "phase `{}` needs either `stages` or both `workers` and `duration_secs`",
                self.name
            ))),
        }
    }

    pub fn to_spec(&self) -> Result<PhaseSpec> {
        Ok(PhaseSpec {
            name: self.name.clone(),
            ramp: self.ramp()?,
            grace: Duration::from_secs(self.grace_secs),
            operation: self.operation.clone(),
            tags: self.tags.iter().collect(),
            iterations_per_worker: self.iterations_per_worker,
            think_time: self.think_time,
        })
    }
}

/// Where reports go, besides the console
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_console")]
    pub console: bool,

    #[serde(default)]
    pub json_path: Option<PathBuf>,

    #[serde(default)]
    pub prometheus_path: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            console: default_console(),
            json_path: None,
            prometheus_path: None,
        }
    }
}

impl RunConfig {
    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a meaningful run
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            return Err(LoadError::InvalidConfig("no phases configured".into()));
        }
        if self.page_size == 0 {
            return Err(LoadError::InvalidConfig("page_size must be positive".into()));
        }
        if self.tick_ms == 0 {
            return Err(LoadError::InvalidConfig("tick_ms must be positive".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(LoadError::InvalidConfig(
                "request_timeout_secs must be positive".into(),
            ));
        }
        reqwest::Url::parse(&self.base_url)
            .map_err(|_| LoadError::InvalidBaseUrl(self.base_url.clone()))?;

        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(LoadError::InvalidConfig("phase with empty name".into()));
            }
            if !seen.insert(phase.name.as_str()) {
                return Err(LoadError::InvalidConfig(format!(
                    "duplicate phase name `{}`",
                    phase.name
                )));
            }
            let ramp = phase.ramp()?;
            if ramp.peak() == 0 {
                return Err(LoadError::InvalidConfig(format!(
                    "phase `{}` never runs any worker",
                    phase.name
                )));
            }
            if phase.iterations_per_worker == Some(0) {
                return Err(LoadError::InvalidConfig(format!(
                    "phase `{}`: iterations_per_worker must be positive",
                    phase.name
                )));
            }
            if let Some(think) = phase.think_time {
                if think.min_ms > think.max_ms {
                    return Err(LoadError::InvalidConfig(format!(
                        "phase `{}`: think_time min_ms exceeds max_ms",
                        phase.name
                    )));
                }
            }
            validate_operation(&phase.name, &phase.operation)?;
        }

        self.rules()?;
        Ok(())
    }

    /// Phases as scheduler input
    pub fn phase_specs(&self) -> Result<Vec<PhaseSpec>> {
        self.phases.iter().map(PhaseConfig::to_spec).collect()
    }

    /// Parsed threshold rules, in selector order
    pub fn rules(&self) -> Result<Vec<ThresholdRule>> {
        let mut rules = Vec::new();
        for (selector, expressions) in &self.thresholds {
            for expression in expressions {
                rules.push(ThresholdRule::parse(selector, expression)?);
            }
        }
        Ok(rules)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: Duration::from_millis(self.tick_ms),
            request_timeout: self.request_timeout(),
            default_page_size: self.page_size,
            progress_interval: (self.progress_interval_secs > 0)
                .then(|| Duration::from_secs(self.progress_interval_secs)),
            seed: self.seed,
            ..SchedulerConfig::default()
        }
    }
}

fn validate_operation(phase: &str, operation: &OperationKind) -> Result<()> {
    let invalid = |reason: &str| {
        Err(LoadError::InvalidConfig(format!("phase `{}`: {}", phase, reason)))
    };
    match operation {
        OperationKind::PaginatedRead {
            page_size: Some(0), ..
        }
        | OperationKind::BurstRead {
            page_size: Some(0), ..
        }
        | OperationKind::SoakRead {
            page_size: Some(0), ..
        }
        | OperationKind::MixedRead {
            page_size: Some(0), ..
        } => invalid("page_size must be positive"),
        OperationKind::SoakRead {
            mid_from_secs,
            late_from_secs,
            ..
        } if mid_from_secs > late_from_secs => invalid("soak mid_from_secs exceeds late_from_secs"),
        OperationKind::MixedRead {
            pagination_weight,
            gpu_weight,
            ram_weight,
            ..
        } if pagination_weight + gpu_weight + ram_weight == 0 => {
            invalid("mixed_read weights sum to zero")
        }
        OperationKind::DuplicateProbe { pool_size: 0 } => invalid("duplicate pool_size must be positive"),
        _ => Ok(()),
    }
}
