// ============================================================
// Layer 3 — Training Schedule State Machine
// ============================================================
// The two-phase training schedule: cross-entropy first, then
// self-critical sequence training, then stop.
//
// One observation per epoch: the validation CIDEr either matches
// or beats the best seen so far (a "best" epoch, patience resets)
// or it does not (patience grows). When patience hits the limit
// the schedule advances one phase; advancing out of the last
// phase stops training. Switching to the RL phase on an epoch
// that is not itself a best epoch requires rolling the model
// back to the best checkpoint first, so self-critical learning
// starts from the strongest cross-entropy weights.
//
// Reference: Rennie et al. (2017) Self-Critical Sequence Training

use serde::{Deserialize, Serialize};

/// Optimization phase of the training loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Teacher-forced negative log-likelihood
    CrossEntropy,
    /// Self-critical sequence training on a CIDEr reward
    SelfCritical,
}

/// What the trainer must do after an epoch's validation score
/// has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep training in the current phase
    Continue,
    /// Enter the RL phase; reload the best checkpoint first when
    /// `rollback` is set (the switch epoch was not a best epoch)
    SwitchToSelfCritical { rollback: bool },
    /// Patience exhausted in the RL phase — training is over
    Stop,
}

/// The epoch verdict: whether this epoch is a new best (the
/// checkpoint manager promotes "last" to "best") and the action
/// to take next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub best: bool,
    pub action: Action,
}

/// Explicit state machine replacing the usual tangle of
/// `use_rl` / `patience` / `best_*` flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSchedule {
    pub phase: Phase,
    pub patience: usize,
    pub best_val_cider: f64,
    pub best_test_cider: f64,
}

impl TrainingSchedule {
    /// Consecutive non-improving epochs tolerated per phase.
    pub const PATIENCE_LIMIT: usize = 5;

    pub fn new() -> Self {
        Self {
            phase: Phase::CrossEntropy,
            patience: 0,
            best_val_cider: 0.0,
            best_test_cider: 0.0,
        }
    }

    /// Feed one epoch's validation CIDEr into the machine.
    /// Equal-or-better counts as an improvement.
    pub fn observe_validation(&mut self, val_cider: f64) -> Verdict {
        let best = val_cider >= self.best_val_cider;
        if best {
            self.best_val_cider = val_cider;
            self.patience = 0;
        } else {
            self.patience += 1;
        }

        let action = if self.patience == Self::PATIENCE_LIMIT {
            match self.phase {
                Phase::CrossEntropy => {
                    self.phase = Phase::SelfCritical;
                    self.patience = 0;
                    Action::SwitchToSelfCritical { rollback: !best }
                }
                Phase::SelfCritical => Action::Stop,
            }
        } else {
            Action::Continue
        };

        Verdict { best, action }
    }

    pub fn observe_test(&mut self, test_cider: f64) {
        if test_cider > self.best_test_cider {
            self.best_test_cider = test_cider;
        }
    }
}

impl Default for TrainingSchedule {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improvement_resets_patience() {
        let mut schedule = TrainingSchedule::new();
        assert!(schedule.observe_validation(0.5).best);
        schedule.observe_validation(0.4);
        schedule.observe_validation(0.3);
        assert_eq!(schedule.patience, 2);
        let verdict = schedule.observe_validation(0.6);
        assert!(verdict.best);
        assert_eq!(schedule.patience, 0);
        assert_eq!(verdict.action, Action::Continue);
    }

    #[test]
    fn test_equal_score_counts_as_best() {
        let mut schedule = TrainingSchedule::new();
        schedule.observe_validation(0.5);
        let verdict = schedule.observe_validation(0.5);
        assert!(verdict.best);
        assert_eq!(schedule.patience, 0);
    }

    #[test]
    fn test_switch_to_rl_after_five_non_improvements() {
        // Scores: one best epoch, then five consecutive regressions.
        let mut schedule = TrainingSchedule::new();
        let scores = [0.5, 0.4, 0.3, 0.2, 0.1, 0.05];
        let mut actions = Vec::new();
        for s in scores {
            actions.push(schedule.observe_validation(s).action);
        }
        assert_eq!(&actions[..5], &[Action::Continue; 5]);
        // The fifth non-improvement flips the phase exactly once,
        // and the switch epoch was not a best epoch, so the best
        // (first) checkpoint must be reloaded before continuing.
        assert_eq!(actions[5], Action::SwitchToSelfCritical { rollback: true });
        assert_eq!(schedule.phase, Phase::SelfCritical);
        assert_eq!(schedule.patience, 0);
        assert!((schedule.best_val_cider - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_stop_after_patience_in_rl_phase() {
        let mut schedule = TrainingSchedule::new();
        schedule.phase = Phase::SelfCritical;
        schedule.best_val_cider = 0.9;
        for _ in 0..4 {
            assert_eq!(schedule.observe_validation(0.1).action, Action::Continue);
        }
        assert_eq!(schedule.observe_validation(0.1).action, Action::Stop);
    }

    #[test]
    fn test_switch_from_resumed_boundary_requests_rollback() {
        // A resumed schedule may land one epoch short of the
        // patience limit; the rollback flag must still reflect
        // the final epoch's verdict.
        let mut schedule = TrainingSchedule::new();
        schedule.patience = TrainingSchedule::PATIENCE_LIMIT - 1;
        schedule.best_val_cider = 0.4;
        let verdict = schedule.observe_validation(0.3);
        assert_eq!(verdict.action, Action::SwitchToSelfCritical { rollback: true });
    }
}
