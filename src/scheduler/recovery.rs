//! Failure classification from filesystem evidence
//!
//! Given what a failed or timed-out task left on the shared filesystem,
//! pick the recovery action. Classification is pure; the scheduler reads
//! the evidence, and only the leader submits the resulting command, so a
//! transiently split brain at worst produces duplicate submissions the
//! state machine deduplicates by attempt.

use crate::storage::{MapEvidence, ReduceEvidence};

/// What the scheduler should do about a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing to do; the task already moved on.
    NoOp,
    /// No durable output survives; rerun from scratch.
    ResetTask,
    /// The work is durable; record completion despite the worker failure.
    MarkCompleted,
    /// Unrecoverable; fail the job.
    Fail,
}

/// Classify a map-task failure.
///
/// A mapper publishes its partition files atomically at the very end, so
/// the files' presence cleanly separates pre-completion failures (rerun)
/// from post-completion ones (the crash is irrelevant: reducers consume
/// files, not workers). Zero-size files count as absent.
pub fn classify_map_failure(evidence: &MapEvidence) -> RecoveryAction {
    if evidence.all_durable() {
        RecoveryAction::MarkCompleted
    } else {
        RecoveryAction::ResetTask
    }
}

/// Classify a reduce-task failure.
///
/// Reducers are always rescheduled; the evidence only decides whether the
/// replacement resumes from a checkpoint (the caller forwards
/// `evidence.checkpoint` with the new assignment) or starts fresh.
pub fn classify_reduce_failure(_evidence: &ReduceEvidence) -> RecoveryAction {
    RecoveryAction::ResetTask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_map_failure_without_output_is_rerun() {
        let evidence = MapEvidence {
            map_index: 0,
            present: vec![],
            missing: vec![0, 1],
            empty: vec![],
        };
        assert_eq!(classify_map_failure(&evidence), RecoveryAction::ResetTask);
    }

    #[test]
    fn test_map_failure_with_durable_output_is_completed() {
        let evidence = MapEvidence {
            map_index: 0,
            present: vec![0, 1],
            missing: vec![],
            empty: vec![],
        };
        assert_eq!(classify_map_failure(&evidence), RecoveryAction::MarkCompleted);
    }

    #[test]
    fn test_map_failure_with_zero_size_file_is_rerun() {
        let evidence = MapEvidence {
            map_index: 0,
            present: vec![0],
            missing: vec![],
            empty: vec![1],
        };
        assert_eq!(classify_map_failure(&evidence), RecoveryAction::ResetTask);
    }

    #[test]
    fn test_reduce_failure_is_always_rescheduled() {
        let fresh = ReduceEvidence {
            reduce_index: 0,
            has_partial: false,
            checkpoint: None,
        };
        assert_eq!(classify_reduce_failure(&fresh), RecoveryAction::ResetTask);

        let mid = ReduceEvidence {
            reduce_index: 0,
            has_partial: true,
            checkpoint: Some(PathBuf::from("/tmp/mr-out-0.checkpoint.json")),
        };
        assert_eq!(classify_reduce_failure(&mid), RecoveryAction::ResetTask);
        assert!(mid.mid_processing());
    }
}
