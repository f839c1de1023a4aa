//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`timeout`]: Per-delivery handler deadline
//! - [`metrics`]: Handler timing and outcome via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes the layers around a [`HandlerRouter`](super::HandlerRouter)

pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use self::metrics::MetricsLayer;
pub use pipeline::{build_dispatch_pipeline, DispatchService};
pub use timeout::TimeoutLayer;
