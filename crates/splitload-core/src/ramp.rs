//! Worker population ramp
//!
//! A ramp is a list of `(duration, target)` stages anchored at a start offset.
//! The population starts at zero when the offset is reached and moves linearly
//! towards each stage target over that stage's duration. After the last stage
//! the final target is held until the owner stops the phase.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One ramp stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage length in seconds (0 = jump immediately to `target`)
    pub duration_secs: u64,

    /// Worker population reached at the end of the stage
    pub target: u32,
}

impl Stage {
    pub fn new(duration_secs: u64, target: u32) -> Self {
        Self {
            duration_secs,
            target,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Piecewise-linear population curve for a phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ramp {
    start_offset: Duration,
    stages: Vec<Stage>,
}

impl Ramp {
    pub fn new(start_offset: Duration, stages: Vec<Stage>) -> Self {
        Self {
            start_offset,
            stages,
        }
    }

    /// Constant population for `duration`, starting at `start_offset`
    pub fn constant(start_offset: Duration, workers: u32, duration_secs: u64) -> Self {
        Self::new(
            start_offset,
            vec![Stage::new(0, workers), Stage::new(duration_secs, workers)],
        )
    }

    pub fn start_offset(&self) -> Duration {
        self.start_offset
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations
    pub fn stages_duration(&self) -> Duration {
        self.stages.iter().map(Stage::duration).sum()
    }

    /// Elapsed run time at which the last stage ends
    pub fn end(&self) -> Duration {
        self.start_offset + self.stages_duration()
    }

    /// Highest target across all stages
    pub fn peak(&self) -> u32 {
        self.stages.iter().map(|s| s.target).max().unwrap_or(0)
    }

    /// Instantaneous target at `elapsed` since the run started
    pub fn target_at(&self, elapsed: Duration) -> f64 {
        if elapsed < self.start_offset {
            return 0.0;
        }
        let t = (elapsed - self.start_offset).as_secs_f64();

        let mut previous = 0.0;
        let mut stage_start = 0.0;
        for stage in &self.stages {
            let length = stage.duration_secs as f64;
            let stage_end = stage_start + length;
            let target = f64::from(stage.target);
            if t < stage_end {
                let progress = (t - stage_start) / length;
                return previous + (target - previous) * progress;
            }
            previous = target;
            stage_start = stage_end;
        }
        previous
    }

    /// Target rounded to a whole number of workers
    pub fn population_at(&self, elapsed: Duration) -> u32 {
        self.target_at(elapsed).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_zero_before_offset() {
        let ramp = Ramp::new(secs(10.0), vec![Stage::new(10, 50)]);
        assert_eq!(ramp.target_at(secs(0.0)), 0.0);
        assert_eq!(ramp.target_at(secs(9.99)), 0.0);
        assert_eq!(ramp.target_at(secs(10.0)), 0.0);
    }

    #[test]
    fn test_linear_interpolation() {
        let ramp = Ramp::new(Duration::ZERO, vec![Stage::new(10, 50), Stage::new(20, 50)]);
        assert_eq!(ramp.target_at(secs(5.0)), 25.0);
        assert_eq!(ramp.target_at(secs(10.0)), 50.0);
        assert_eq!(ramp.target_at(secs(25.0)), 50.0);
        assert_eq!(ramp.population_at(secs(2.5)), 13);
    }

    #[test]
    fn test_holds_after_last_stage() {
        let ramp = Ramp::new(Duration::ZERO, vec![Stage::new(5, 100), Stage::new(5, 30)]);
        assert_eq!(ramp.target_at(secs(10.0)), 30.0);
        assert_eq!(ramp.target_at(secs(3600.0)), 30.0);
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let ramp = Ramp::new(secs(2.0), vec![Stage::new(0, 400)]);
        assert_eq!(ramp.target_at(secs(1.0)), 0.0);
        assert_eq!(ramp.target_at(secs(2.0)), 400.0);
        assert_eq!(ramp.target_at(secs(2.001)), 400.0);
    }

    #[test]
    fn test_ramp_down() {
        let ramp = Ramp::new(
            Duration::ZERO,
            vec![Stage::new(5, 400), Stage::new(15, 400), Stage::new(5, 30)],
        );
        assert_eq!(ramp.target_at(secs(22.5)), 215.0);
        assert_eq!(ramp.end(), secs(25.0));
        assert_eq!(ramp.peak(), 400);
    }

    #[test]
    fn test_constant() {
        let ramp = Ramp::constant(secs(20.0), 30, 60);
        assert_eq!(ramp.population_at(secs(19.0)), 0);
        assert_eq!(ramp.population_at(secs(20.0)), 30);
        assert_eq!(ramp.population_at(secs(50.0)), 30);
        assert_eq!(ramp.end(), secs(80.0));
    }

    fn stages_strategy() -> impl Strategy<Value = Vec<Stage>> {
        prop::collection::vec((0u64..60, 0u32..500), 1..6)
            .prop_map(|v| v.into_iter().map(|(d, t)| Stage::new(d, t)).collect())
    }

    proptest! {
        #[test]
        fn prop_boundaries_hit_declared_targets(stages in stages_strategy(), offset in 0u64..30) {
            let ramp = Ramp::new(Duration::from_secs(offset), stages.clone());
            let mut boundary = offset;
            for (i, stage) in stages.iter().enumerate() {
                boundary += stage.duration_secs;
                let next_is_instant = stages.get(i + 1).map_or(false, |s| s.duration_secs == 0);
                if !next_is_instant {
                    prop_assert_eq!(ramp.target_at(Duration::from_secs(boundary)), f64::from(stage.target));
                }
            }
        }

        #[test]
        fn prop_continuous_within_stages(stages in stages_strategy(), probe in 0u64..300_000) {
            let ramp = Ramp::new(Duration::ZERO, stages.clone());
            let at = Duration::from_millis(probe);
            let next = at + Duration::from_millis(1);
            // Only instant stages may jump; any other step is bounded by the steepest slope.
            let steepest = stages
                .iter()
                .filter(|s| s.duration_secs > 0)
                .map(|s| 500.0 / s.duration_secs as f64)
                .fold(0.0, f64::max);
            let has_instant = stages.iter().any(|s| s.duration_secs == 0);
            let delta = (ramp.target_at(next) - ramp.target_at(at)).abs();
            prop_assert!(has_instant || delta <= steepest * 0.001 + 1e-9);
        }

        #[test]
        fn prop_bounded_by_peak(stages in stages_strategy(), probe in 0u64..400) {
            let ramp = Ramp::new(Duration::ZERO, stages);
            let value = ramp.target_at(Duration::from_secs(probe));
            prop_assert!(value >= 0.0);
            prop_assert!(value <= f64::from(ramp.peak()));
        }
    }
}
