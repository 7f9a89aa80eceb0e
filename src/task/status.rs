//! Task status as reported in status updates and stored in records.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
///
/// Stored by ordinal in the records table and carried by ordinal on the
/// wire-level status update tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Enqueued,
    Running,
    Complete,
    NotFound,
    Failed,
    Canceled,
    WaitingToRetry,
    Paused,
}

impl TaskStatus {
    pub fn ordinal(self) -> u8 {
        match self {
            TaskStatus::Enqueued => 0,
            TaskStatus::Running => 1,
            TaskStatus::Complete => 2,
            TaskStatus::NotFound => 3,
            TaskStatus::Failed => 4,
            TaskStatus::Canceled => 5,
            TaskStatus::WaitingToRetry => 6,
            TaskStatus::Paused => 7,
        }
    }

    pub fn from_ordinal(n: u8) -> Option<Self> {
        Some(match n {
            0 => TaskStatus::Enqueued,
            1 => TaskStatus::Running,
            2 => TaskStatus::Complete,
            3 => TaskStatus::NotFound,
            4 => TaskStatus::Failed,
            5 => TaskStatus::Canceled,
            6 => TaskStatus::WaitingToRetry,
            7 => TaskStatus::Paused,
            _ => return None,
        })
    }

    /// A final state ends the task's lifecycle in the engine; `paused` is
    /// final until the caller resumes.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete
                | TaskStatus::NotFound
                | TaskStatus::Failed
                | TaskStatus::Canceled
                | TaskStatus::Paused
        )
    }

    /// Sentinel progress value reported alongside non-success states.
    pub fn progress_sentinel(self) -> Option<f64> {
        match self {
            TaskStatus::Failed => Some(-1.0),
            TaskStatus::Canceled => Some(-2.0),
            TaskStatus::NotFound => Some(-3.0),
            TaskStatus::WaitingToRetry => Some(-4.0),
            TaskStatus::Paused => Some(-5.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_roundtrip() {
        for n in 0..8u8 {
            let s = TaskStatus::from_ordinal(n).unwrap();
            assert_eq!(s.ordinal(), n);
        }
        assert_eq!(TaskStatus::from_ordinal(8), None);
    }

    #[test]
    fn final_states() {
        assert!(TaskStatus::Complete.is_final());
        assert!(TaskStatus::NotFound.is_final());
        assert!(TaskStatus::Failed.is_final());
        assert!(TaskStatus::Canceled.is_final());
        assert!(TaskStatus::Paused.is_final());
        assert!(!TaskStatus::Enqueued.is_final());
        assert!(!TaskStatus::Running.is_final());
        assert!(!TaskStatus::WaitingToRetry.is_final());
    }

    #[test]
    fn progress_sentinels() {
        assert_eq!(TaskStatus::Failed.progress_sentinel(), Some(-1.0));
        assert_eq!(TaskStatus::Canceled.progress_sentinel(), Some(-2.0));
        assert_eq!(TaskStatus::NotFound.progress_sentinel(), Some(-3.0));
        assert_eq!(TaskStatus::WaitingToRetry.progress_sentinel(), Some(-4.0));
        assert_eq!(TaskStatus::Paused.progress_sentinel(), Some(-5.0));
        assert_eq!(TaskStatus::Running.progress_sentinel(), None);
    }
}
