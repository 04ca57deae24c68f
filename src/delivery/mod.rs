//! Delivery of new items to subscribing destinations
//!
//! ```text
//!   NewArticle ──▶ DeliveryPipeline ──(fan-out per subscription)──┐
//!                                                                 ▼
//!                        render + filter ──blocked──▶ AuditRecorder
//!                               │
//!                               ▼
//!                     DestinationLimiter ──over budget──▶ DestinationQueues
//!                               │                               │
//!                               └──────────▶ Transport ◀────────┘
//! ```

pub mod audit;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod render;
pub mod transport;

use thiserror::Error;

pub use audit::AuditRecorder;
pub use pipeline::{DeliveryMode, DeliveryOutcome, DeliveryPipeline, DeliveryStats, DeliveryStatsSnapshot};
pub use queue::DestinationQueues;
pub use ratelimit::{BudgetExhausted, DestinationLimiter, Tier};
pub use render::{ArticleRenderer, Rendered, TemplateRenderer};
pub use transport::{JobMetadata, OutboundJob, Transport, TransportError};

/// Errors raised while delivering one item to one subscription
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Template rendering failed
    #[error("Render failed: {0}")]
    Render(String),

    /// Transport rejected or failed the send
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The destination queue is no longer accepting jobs
    #[error("Delivery queue for {destination} is closed")]
    QueueClosed { destination: String },
}

impl DeliveryError {
    /// Check if a later attempt may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::QueueClosed { .. } => true,
            Self::Render(_) => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_rate_limit())
    }
}
