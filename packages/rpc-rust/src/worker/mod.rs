//! Worker pool: consumes a service queue and dispatches deliveries to
//! handlers registered by routing key.
//!
//! - [`router`]: routing key to handler service table
//! - [`middleware`]: metrics and timeout layers around the router
//! - [`disposition`]: maps a dispatch result to reply + ack/requeue/dead-letter
//! - [`drain`]: stop signal and in-flight tracking for graceful shutdown
//! - [`pool`]: the worker tasks

pub mod disposition;
pub mod drain;
pub mod middleware;
pub mod pool;
pub mod router;

use bytes::Bytes;
use switchboard_core::{CorrelationId, RoutingKey};

use crate::broker::Delivery;

pub use disposition::{Decision, Disposition};
pub use drain::{DrainTracker, PoolState};
pub use middleware::{build_dispatch_pipeline, DispatchService};
pub use pool::{PoolError, WorkerPool};
pub use router::HandlerRouter;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// What a handler service receives for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub routing_key: RoutingKey,
    pub payload: Bytes,
    /// Present for requests; `None` for notifications.
    pub correlation_id: Option<CorrelationId>,
    /// The broker delivered this message before.
    pub redelivered: bool,
    pub content_type: String,
}

impl Inbound {
    #[must_use]
    pub fn from_delivery(delivery: &Delivery) -> Self {
        let envelope = &delivery.envelope;
        Self {
            routing_key: envelope.routing_key.clone(),
            payload: envelope.body.clone(),
            correlation_id: envelope.correlation_id().cloned(),
            redelivered: delivery.redelivered,
            content_type: envelope.content_type.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Business-logic failure reported by a handler.
///
/// `retryable` is the handler's classification: a transient fault (e.g. the
/// persistence layer is unavailable) may succeed on redelivery; anything else
/// is permanent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Why a delivery was not handled successfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No handler claims the routing key. Permanent.
    #[error("no handler registered for routing key '{routing_key}'")]
    Unroutable { routing_key: String },
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error("handler did not finish within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// The handler panicked. Permanent.
    #[error("handler panicked: {message}")]
    Panicked { message: String },
}

impl DispatchError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Unroutable { .. } => "unroutable",
            DispatchError::Handler(_) => "handler",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Panicked { .. } => "panicked",
        }
    }
}
