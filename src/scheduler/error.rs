//! Error types for the scheduler module

use std::fmt;

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduler-specific errors
#[derive(Debug)]
pub enum SchedulerError {
    /// Two schedules declare the same refresh rate
    DuplicateRefreshRate {
        first: String,
        second: String,
        minutes: f64,
    },

    /// The fast tier shares its refresh rate with the default schedule
    FastTierRateConflict {
        name: String,
        minutes: f64,
    },

    /// A schedule has no usable refresh rate
    MissingRefreshRate {
        name: String,
    },

    /// A custom schedule can never match anything
    EmptySchedule {
        name: String,
    },

    /// Two schedules share a name
    DuplicateName {
        name: String,
    },

    /// A schedule name is not known to the manager
    UnknownSchedule {
        name: String,
    },

    /// A cycle of this schedule is still running
    CycleInProgress {
        name: String,
        run: u64,
    },

    /// A cycle could not load its inputs
    CycleFailed {
        name: String,
        run: u64,
        reason: String,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRefreshRate {
                first,
                second,
                minutes,
            } => {
                write!(
                    f,
                    "Schedules '{}' and '{}' share refresh rate {} minutes",
                    first, second, minutes
                )
            }
            Self::FastTierRateConflict { name, minutes } => {
                write!(
                    f,
                    "Fast tier schedule '{}' must not use the default refresh rate ({} minutes)",
                    name, minutes
                )
            }
            Self::MissingRefreshRate { name } => {
                write!(f, "Schedule '{}' has no positive refresh rate", name)
            }
            Self::EmptySchedule { name } => {
                write!(
                    f,
                    "Schedule '{}' has neither keywords nor subscription ids",
                    name
                )
            }
            Self::DuplicateName { name } => {
                write!(f, "Schedule name '{}' is declared more than once", name)
            }
            Self::UnknownSchedule { name } => {
                write!(f, "Unknown schedule: {}", name)
            }
            Self::CycleInProgress { name, run } => {
                write!(f, "Schedule '{}' is still running cycle #{}", name, run)
            }
            Self::CycleFailed { name, run, reason } => {
                write!(f, "Cycle #{} of schedule '{}' failed: {}", run, name, reason)
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl SchedulerError {
    /// Create a duplicate refresh rate error
    pub fn duplicate_rate(first: impl Into<String>, second: impl Into<String>, minutes: f64) -> Self {
        Self::DuplicateRefreshRate {
            first: first.into(),
            second: second.into(),
            minutes,
        }
    }

    /// Create an unknown schedule error
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::UnknownSchedule { name: name.into() }
    }

    /// Check if the error is recoverable
    ///
    /// Validation errors prevent startup. A busy schedule or a failed load
    /// may clear up on the next tick.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CycleInProgress { .. } | Self::CycleFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rate_error() {
        let err = SchedulerError::duplicate_rate("default", "news", 10.0);
        let msg = err.to_string();
        assert!(msg.contains("default"));
        assert!(msg.contains("news"));
        assert!(msg.contains("10"));
    }

    #[test]
    fn test_is_recoverable() {
        let busy = SchedulerError::CycleInProgress {
            name: "default".to_string(),
            run: 3,
        };
        assert!(busy.is_recoverable());

        let invalid = SchedulerError::MissingRefreshRate {
            name: "slow".to_string(),
        };
        assert!(!invalid.is_recoverable());
    }

    #[test]
    fn test_unknown_schedule() {
        let err = SchedulerError::unknown("ghost");
        assert!(matches!(err, SchedulerError::UnknownSchedule { .. }));
        assert_eq!(err.to_string(), "Unknown schedule: ghost");
    }
}
