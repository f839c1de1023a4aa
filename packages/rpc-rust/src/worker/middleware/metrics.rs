//! Metrics middleware for handler dispatch.
//!
//! Wraps every dispatch in a `handler` span and records duration and outcome
//! both on the span and as `metrics` histogram/counter samples.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::worker::{DispatchError, Inbound};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments handler dispatch.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records handler duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Inbound> for MetricsService<S>
where
    S: Service<Inbound, Response = Bytes, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Bytes;
    type Error = DispatchError;
    type Future = Pin<Box<dyn Future<Output = Result<Bytes, DispatchError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, inbound: Inbound) -> Self::Future {
        let routing_key = inbound.routing_key.as_str().to_string();
        let span = info_span!(
            "handler",
            routing_key = %routing_key,
            correlation_id = inbound.correlation_id.as_ref().map(|id| id.as_str()),
            redelivered = inbound.redelivered,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(inbound);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind(),
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                ::metrics::histogram!(
                    "switchboard_handler_duration_seconds",
                    "routing_key" => routing_key.clone(),
                    "outcome" => outcome
                )
                .record(elapsed.as_secs_f64());

                tracing::debug!(
                    routing_key = %routing_key,
                    duration_ms,
                    outcome,
                    "handler complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
