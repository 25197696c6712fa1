/// Sampling schedules for the supervisor.
///
/// Interval mode samples on a fixed period. Lightweight mode samples at four
/// lifecycle checkpoints only, each of which fires at most once per run.
use std::time::Duration;

/// Elapsed time after which the early checkpoint becomes due.
pub const EARLY_CHECKPOINT: Duration = Duration::from_secs(5);
/// Elapsed time after which the steady-state checkpoint becomes due.
pub const STEADY_CHECKPOINT: Duration = Duration::from_secs(60);
/// Bounds on the interval-mode period.
pub const MIN_PERIOD: Duration = Duration::from_millis(10);
pub const MAX_PERIOD: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Start,
    Early,
    Steady,
    Final,
}

impl Checkpoint {
    const ALL: [Checkpoint; 4] = [
        Checkpoint::Start,
        Checkpoint::Early,
        Checkpoint::Steady,
        Checkpoint::Final,
    ];

    fn index(self) -> usize {
        match self {
            Checkpoint::Start => 0,
            Checkpoint::Early => 1,
            Checkpoint::Steady => 2,
            Checkpoint::Final => 3,
        }
    }

    /// Elapsed time at which a timed checkpoint becomes due. `Final` is
    /// triggered by process exit, not by time.
    fn due_at(self) -> Option<Duration> {
        match self {
            Checkpoint::Start => Some(Duration::ZERO),
            Checkpoint::Early => Some(EARLY_CHECKPOINT),
            Checkpoint::Steady => Some(STEADY_CHECKPOINT),
            Checkpoint::Final => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::Start => "start",
            Checkpoint::Early => "early",
            Checkpoint::Steady => "steady",
            Checkpoint::Final => "final",
        }
    }
}

/// Tracks which lightweight-mode checkpoints have fired.
#[derive(Debug, Default, Clone)]
pub struct CheckpointPlan {
    fired: [bool; 4],
}

impl CheckpointPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, checkpoint: Checkpoint) -> bool {
        self.fired[checkpoint.index()]
    }

    /// Claim the earliest timed checkpoint that is due at `elapsed` and has not
    /// fired yet. Checkpoints that were skipped over are marked fired too, so a
    /// late tick never produces a burst of samples.
    pub fn claim_due(&mut self, elapsed: Duration) -> Option<Checkpoint> {
        let mut claimed = None;
        for checkpoint in Checkpoint::ALL {
            let Some(due_at) = checkpoint.due_at() else {
                continue;
            };
            if self.has_fired(checkpoint) || elapsed < due_at {
                continue;
            }
            self.fired[checkpoint.index()] = true;
            claimed = Some(checkpoint);
        }
        claimed
    }

    /// Claim the close-of-process checkpoint. Returns false if it already fired.
    pub fn claim_final(&mut self) -> bool {
        let idx = Checkpoint::Final.index();
        if self.fired[idx] {
            return false;
        }
        self.fired[idx] = true;
        true
    }

    /// Elapsed time at which the next timed checkpoint becomes due.
    pub fn next_due(&self) -> Option<Duration> {
        Checkpoint::ALL
            .into_iter()
            .filter(|c| !self.has_fired(*c))
            .find_map(|c| c.due_at())
    }
}

/// How the supervisor decides when to sample.
#[derive(Debug, Clone)]
pub enum SamplingPolicy {
    Interval(Duration),
    Checkpoints(CheckpointPlan),
}

impl SamplingPolicy {
    /// A zero interval selects lightweight mode. Periods that cannot be
    /// represented are clamped into `[MIN_PERIOD, MAX_PERIOD]`.
    pub fn from_interval_secs(secs: f64) -> Self {
        if secs.is_nan() || secs <= 0.0 {
            return SamplingPolicy::Checkpoints(CheckpointPlan::new());
        }
        let period = Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_PERIOD)
            .clamp(MIN_PERIOD, MAX_PERIOD);
        SamplingPolicy::Interval(period)
    }

    pub fn is_lightweight(&self) -> bool {
        matches!(self, SamplingPolicy::Checkpoints(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_is_due_immediately() {
        let mut plan = CheckpointPlan::new();
        assert_eq!(plan.next_due(), Some(Duration::ZERO));
        assert_eq!(plan.claim_due(Duration::ZERO), Some(Checkpoint::Start));
        assert!(plan.has_fired(Checkpoint::Start));
    }

    #[test]
    fn test_each_checkpoint_fires_at_most_once() {
        let mut plan = CheckpointPlan::new();
        assert_eq!(plan.claim_due(Duration::ZERO), Some(Checkpoint::Start));
        assert_eq!(plan.claim_due(Duration::from_secs(1)), None);
        assert_eq!(plan.claim_due(Duration::from_secs(5)), Some(Checkpoint::Early));
        // Repeated ticks in the early window do nothing
        for s in 6..60 {
            assert_eq!(plan.claim_due(Duration::from_secs(s)), None);
        }
        assert_eq!(
            plan.claim_due(Duration::from_secs(60)),
            Some(Checkpoint::Steady)
        );
        assert_eq!(plan.claim_due(Duration::from_secs(3600)), None);
        assert_eq!(plan.next_due(), None);
    }

    #[test]
    fn test_late_tick_collapses_missed_checkpoints() {
        let mut plan = CheckpointPlan::new();
        plan.claim_due(Duration::ZERO);
        // Tick arrives after both early and steady are due: one sample only
        assert_eq!(
            plan.claim_due(Duration::from_secs(90)),
            Some(Checkpoint::Steady)
        );
        assert!(plan.has_fired(Checkpoint::Early));
        assert_eq!(plan.claim_due(Duration::from_secs(91)), None);
    }

    #[test]
    fn test_final_fires_once() {
        let mut plan = CheckpointPlan::new();
        assert!(plan.claim_final());
        assert!(!plan.claim_final());
        // Final is never returned by the timed path
        assert_eq!(plan.claim_due(Duration::ZERO), Some(Checkpoint::Start));
    }

    #[test]
    fn test_next_due_advances() {
        let mut plan = CheckpointPlan::new();
        plan.claim_due(Duration::ZERO);
        assert_eq!(plan.next_due(), Some(EARLY_CHECKPOINT));
        plan.claim_due(EARLY_CHECKPOINT);
        assert_eq!(plan.next_due(), Some(STEADY_CHECKPOINT));
    }

    #[test]
    fn test_policy_from_interval() {
        assert!(SamplingPolicy::from_interval_secs(0.0).is_lightweight());
        match SamplingPolicy::from_interval_secs(2.0) {
            SamplingPolicy::Interval(d) => assert_eq!(d, Duration::from_secs(2)),
            other => panic!("expected interval policy, got {other:?}"),
        }
        match SamplingPolicy::from_interval_secs(0.5) {
            SamplingPolicy::Interval(d) => assert_eq!(d, Duration::from_millis(500)),
            other => panic!("expected interval policy, got {other:?}"),
        }
    }

    #[test]
    fn test_policy_clamps_unrepresentable_periods() {
        for (secs, expected) in [
            (1e20, MAX_PERIOD),
            (f64::INFINITY, MAX_PERIOD),
            (1e-12, MIN_PERIOD),
        ] {
            match SamplingPolicy::from_interval_secs(secs) {
                SamplingPolicy::Interval(d) => assert_eq!(d, expected),
                other => panic!("expected interval policy for {secs}, got {other:?}"),
            }
        }
        assert!(SamplingPolicy::from_interval_secs(f64::NAN).is_lightweight());
    }

    #[test]
    fn test_checkpoint_names() {
        let names: Vec<_> = Checkpoint::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(names, vec!["start", "early", "steady", "final"]);
    }
}
