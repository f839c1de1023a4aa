//! Pipeline composition: wraps the handler router with the middleware layers.

use bytes::Bytes;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::config::PoolConfig;
use crate::worker::{DispatchError, HandlerRouter, Inbound};

/// Type-erased dispatch stack; each worker owns a clone.
pub type DispatchService = BoxCloneService<Inbound, Bytes, DispatchError>;

/// Builds the dispatch pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- span, duration, and outcome, including timeouts
/// 2. `TimeoutLayer` -- enforce `handler_timeout_ms`
/// 3. `HandlerRouter` -- routing key lookup
///
/// Backpressure is applied by the broker's prefetch bound, not here.
#[must_use]
pub fn build_dispatch_pipeline(router: HandlerRouter, config: &PoolConfig) -> DispatchService {
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(MetricsLayer)
            .layer(TimeoutLayer::new(config.handler_timeout()))
            .service(router),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
