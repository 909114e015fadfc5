// This module defines the error types for the scheduler using the thiserror crate.
// SchedulerError separates the failure classes the scheduling core distinguishes:
// precondition violations (a graph queried before a machine was bound, unknown ids),
// machine insufficiency (no unit implements an operation, no bus or scratch register
// can connect two terminals), scheduling failures surfaced after a bounded search,
// internal invariant violations found by the DDG sanity check (carrying a dot dump of
// the graph) and listing parse errors. Expected "not here, try another cycle" answers
// are plain bool/Option results and never reach this type. ScheduleResult<T> is the
// convenience alias used throughout the crate.

//! Error types for the scheduler.

use thiserror::Error;

/// Main error type for scheduling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Precondition violated: {reason}")]
    Precondition {
        reason: String,
    },

    #[error("Invalid machine description: {reason}")]
    InvalidMachine {
        reason: String,
    },

    #[error("No function unit supports operation {operation}")]
    NoUnitSupportsOperation {
        operation: String,
    },

    #[error("Machine cannot execute {context}: {reason}")]
    MachineInsufficiency {
        context: String,
        reason: String,
    },

    #[error("Scheduling {node} failed: {reason}")]
    SchedulingFailed {
        node: String,
        reason: String,
    },

    #[error("Internal invariant violated: {reason}")]
    InternalInvariant {
        reason: String,
        /// Dot rendering of the graph the violation was found in.
        dot: Option<String>,
    },

    #[error("Listing error at line {line}: {reason}")]
    Listing {
        line: usize,
        reason: String,
    },
}

impl SchedulerError {
    pub fn precondition(reason: impl Into<String>) -> Self {
        SchedulerError::Precondition { reason: reason.into() }
    }

    pub fn insufficiency(context: impl Into<String>, reason: impl Into<String>) -> Self {
        SchedulerError::MachineInsufficiency {
            context: context.into(),
            reason: reason.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        SchedulerError::InternalInvariant {
            reason: reason.into(),
            dot: None,
        }
    }

    /// True for errors caused by the target machine rather than the program or a defect.
    pub fn is_machine_insufficiency(&self) -> bool {
        matches!(
            self,
            SchedulerError::MachineInsufficiency { .. }
                | SchedulerError::NoUnitSupportsOperation { .. }
        )
    }
}

/// Result type alias for scheduling operations.
pub type ScheduleResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SchedulerError::insufficiency("RF.1 -> add.1", "no bus connects RF to ALU.in1");
        assert_eq!(
            err.to_string(),
            "Machine cannot execute RF.1 -> add.1: no bus connects RF to ALU.in1"
        );
        assert!(err.is_machine_insufficiency());
        assert!(!SchedulerError::invariant("dangling edge").is_machine_insufficiency());
    }
}
