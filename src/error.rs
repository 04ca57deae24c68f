//! Crate-level error type
//!
//! Every subsystem keeps its own error enum ([`SchedulerError`],
//! [`StorageError`], [`FetchError`], [`TransportError`], [`DeliveryError`]).
//! [`Error`] folds them together for callers that cross subsystem borders,
//! such as the schedule manager's manual refresh and the binary.
//!
//! ```text
//!   FetchError ─┐
//! StorageError ─┤
//! TransportErr ─┼──► Error ──► category() / is_recoverable()
//! DeliveryErr ──┤
//! SchedulerErr ─┘
//! ```

use thiserror::Error;

pub use crate::delivery::transport::TransportError;
pub use crate::delivery::DeliveryError;
pub use crate::fetch::FetchError;
pub use crate::scheduler::error::SchedulerError;
pub use crate::storage::StorageError;

/// Coarse grouping used for logging and metrics labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Source fetches and outbound HTTP
    Network,
    /// Feed documents that could not be parsed
    Parsing,
    Storage,
    Delivery,
    /// Schedule validation and runtime
    Scheduler,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Parsing => "parsing",
            Self::Storage => "storage",
            Self::Delivery => "delivery",
            Self::Scheduler => "scheduler",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// A manual refresh named a URL nobody actively subscribes to
    #[error("No active subscriptions for {url}")]
    NoSubscribers { url: String },

    /// The delivery dispatcher is gone, new articles have nowhere to go
    #[error("Delivery channel closed")]
    DeliveryChannelClosed,
}

impl Error {
    /// Whether a later attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Scheduler(e) => e.is_recoverable(),
            Self::Storage(e) => e.is_recoverable(),
            Self::Fetch(e) => e.is_recoverable(),
            Self::Transport(e) => e.is_recoverable(),
            Self::Delivery(e) => e.is_recoverable(),
            Self::NoSubscribers { .. } | Self::DeliveryChannelClosed => false,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Scheduler(_) => ErrorCategory::Scheduler,
            Self::Storage(_) => ErrorCategory::Storage,
            Self::Fetch(FetchError::Parse(_)) => ErrorCategory::Parsing,
            Self::Fetch(_) | Self::Transport(_) => ErrorCategory::Network,
            Self::Delivery(_) | Self::DeliveryChannelClosed => ErrorCategory::Delivery,
            Self::NoSubscribers { .. } => ErrorCategory::Scheduler,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_failures_are_their_own_category() {
        let timeout = Error::Fetch(FetchError::Timeout);
        assert_eq!(timeout.category(), ErrorCategory::Network);
        assert!(timeout.is_recoverable());

        let parse = Error::Fetch(FetchError::Parse("not xml".to_string()));
        assert_eq!(parse.category(), ErrorCategory::Parsing);
    }

    #[test]
    fn test_schedule_conflicts_are_fatal() {
        let err = Error::Scheduler(SchedulerError::DuplicateRefreshRate {
            first: "default".to_string(),
            second: "slow".to_string(),
            minutes: 10.0,
        });
        assert!(!err.is_recoverable());
        assert_eq!(err.category().to_string(), "scheduler");
    }

    #[test]
    fn test_transport_errors_convert() {
        let unified: Error = TransportError::InvalidPayload("too long".to_string()).into();
        assert!(matches!(unified, Error::Transport(_)));
        assert_eq!(unified.category(), ErrorCategory::Network);
    }

    #[test]
    fn test_refresh_errors() {
        let err = Error::NoSubscribers {
            url: "https://x/feed".to_string(),
        };
        assert_eq!(err.to_string(), "No active subscriptions for https://x/feed");
        assert!(!err.is_recoverable());
        assert_eq!(Error::DeliveryChannelClosed.category(), ErrorCategory::Delivery);
    }
}
