//! Selection and reward policy for the task tree.
//!
//! Selection uses an upper-confidence score so that decomposed approaches are
//! each explored at least once before the best-performing branch is pursued.
//! Rewards come exclusively from verification evidence; the controlled
//! program's own claims never enter the computation.

use crate::core::types::EvidenceRecord;

/// Exploration/exploitation knobs. Both are contested in practice, so both
/// are configuration rather than constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyParams {
    /// `C` in the upper-confidence formula. Low values favor exploitation.
    pub exploration_constant: f64,
    /// Per-level decay applied when a reward propagates to ancestors.
    pub reward_decay: f64,
    /// A branch whose reward reaches this threshold is terminal.
    pub quality_threshold: f64,
}

impl Default for PolicyParams {
    fn default() -> Self {
        Self {
            exploration_constant: 0.5,
            reward_decay: 0.9,
            quality_threshold: 0.7,
        }
    }
}

/// Upper-confidence score for one child.
///
/// `average + C * sqrt(ln(parent_visits) / child_visits)`. Unexplored
/// children score `+inf` so every child is visited once before any is
/// revisited.
pub fn ucb_score(child_visits: u32, child_average: f64, parent_visits: u32, c: f64) -> f64 {
    if child_visits == 0 {
        return f64::INFINITY;
    }
    let parent = f64::from(parent_visits.max(1));
    let exploration = c * (parent.ln() / f64::from(child_visits)).sqrt();
    child_average + exploration
}

/// Compute a reward in `[-1, 1]` from verification evidence.
///
/// A non-zero exit or a crash forces `-1.0` (the branch is pruned by the
/// tree manager). Otherwise the reward is the sum of an artifact component
/// (0.5 when any file was created or modified) and a check component
/// (`0.5 * (passed - failed) / total`). With no artifacts and no checks the
/// reward is 0.0, so a transcript that merely *claims* success scores nothing.
pub fn reward_from_evidence(evidence: &EvidenceRecord) -> f64 {
    if evidence.crashed || evidence.exit_code != Some(0) {
        return -1.0;
    }

    let artifact = if evidence.artifact_count() > 0 { 0.5 } else { 0.0 };

    let total = evidence.checks_passed + evidence.checks_failed;
    let checks = if total == 0 {
        0.0
    } else {
        let passed = f64::from(evidence.checks_passed);
        let failed = f64::from(evidence.checks_failed);
        0.5 * (passed - failed) / f64::from(total)
    };

    (artifact + checks).clamp(-1.0, 1.0)
}

/// Decayed contribution of `reward` at `distance` levels above the source.
pub fn decayed(reward: f64, decay: f64, distance: u32) -> f64 {
    reward * decay.powi(distance as i32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ArtifactEvidence;

    fn artifact(path: &str) -> ArtifactEvidence {
        ArtifactEvidence {
            path: path.to_string(),
            bytes: 10,
            sha256: "00".repeat(32),
        }
    }

    #[test]
    fn unexplored_child_scores_infinity() {
        assert_eq!(ucb_score(0, 0.0, 5, 0.5), f64::INFINITY);
    }

    #[test]
    fn less_visited_child_scores_strictly_higher_at_equal_average() {
        let a = ucb_score(2, 0.4, 10, 0.5);
        let b = ucb_score(8, 0.4, 10, 0.5);
        assert!(a > b, "expected {a} > {b}");
    }

    #[test]
    fn nonzero_exit_forces_negative_one() {
        let evidence = EvidenceRecord {
            exit_code: Some(2),
            files_created: vec![artifact("calc.py")],
            checks_passed: 5,
            ..EvidenceRecord::default()
        };
        assert_eq!(reward_from_evidence(&evidence), -1.0);
    }

    #[test]
    fn crash_forces_negative_one_even_with_zero_exit() {
        let evidence = EvidenceRecord {
            exit_code: Some(0),
            crashed: true,
            ..EvidenceRecord::default()
        };
        assert_eq!(reward_from_evidence(&evidence), -1.0);
    }

    #[test]
    fn claimed_success_without_artifacts_scores_at_most_zero() {
        let evidence = EvidenceRecord {
            exit_code: Some(0),
            ..EvidenceRecord::default()
        };
        assert!(reward_from_evidence(&evidence) <= 0.0);
    }

    #[test]
    fn artifacts_and_passing_checks_score_positive() {
        let evidence = EvidenceRecord {
            exit_code: Some(0),
            files_created: vec![artifact("calc.py")],
            checks_passed: 3,
            checks_failed: 0,
            ..EvidenceRecord::default()
        };
        assert_eq!(reward_from_evidence(&evidence), 1.0);
    }

    #[test]
    fn failing_checks_drag_reward_down() {
        let evidence = EvidenceRecord {
            exit_code: Some(0),
            files_created: vec![artifact("calc.py")],
            checks_passed: 1,
            checks_failed: 3,
            ..EvidenceRecord::default()
        };
        let reward = reward_from_evidence(&evidence);
        assert!(reward < 0.5, "expected < 0.5, got {reward}");
        assert!(reward > -1.0);
    }

    #[test]
    fn decay_compounds_per_level() {
        assert!((decayed(1.0, 0.9, 2) - 0.81).abs() < 1e-9);
        assert_eq!(decayed(0.5, 0.9, 0), 0.5);
    }
}
