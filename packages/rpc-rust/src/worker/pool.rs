//! Worker pool over one service queue.
//!
//! A single consumer is attached with `prefetch` as its unacked bound, and
//! `concurrency` worker tasks take turns pulling from its delivery stream.
//! A slow handler therefore throttles the broker instead of buffering
//! deliveries in process.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::disposition::{settle, Decision};
use super::drain::{stopped, DrainTracker, PoolState};
use super::middleware::{build_dispatch_pipeline, DispatchService};
use super::{DispatchError, HandlerRouter, Inbound};
use crate::broker::{Broker, BrokerError, BrokerHandle, ConsumeOptions, Delivery, DeliveryStream};
use crate::config::{ConfigError, PoolConfig};

type SharedStream = Arc<Mutex<DeliveryStream>>;

/// Failure to start a pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to consume queue: {0}")]
    Broker(#[from] BrokerError),
}

/// Running worker pool.
pub struct WorkerPool {
    queue: String,
    tracker: Arc<DrainTracker>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Attaches a consumer to `queue` and spawns the workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Config` for an invalid concurrency/prefetch pair and
    /// `PoolError::Broker` if the consumer cannot be attached.
    pub async fn start(
        broker: BrokerHandle,
        queue: &str,
        config: &PoolConfig,
        router: HandlerRouter,
    ) -> Result<Self, PoolError> {
        let prefetch = config.effective_prefetch()?;
        let stream = broker
            .consume(
                queue,
                ConsumeOptions::work_queue(prefetch, config.consumer_tag.clone()),
            )
            .await?;
        let stream: SharedStream = Arc::new(Mutex::new(stream));
        let service = build_dispatch_pipeline(router, config);
        let tracker = Arc::new(DrainTracker::new());

        let workers = (0..config.concurrency)
            .map(|id| {
                let span = info_span!("worker", queue = %queue, id);
                tokio::spawn(
                    run_worker(
                        Arc::clone(&stream),
                        service.clone(),
                        Arc::clone(&broker),
                        Arc::clone(&tracker),
                    )
                    .instrument(span),
                )
            })
            .collect();

        info!(
            queue = %queue,
            concurrency = config.concurrency,
            prefetch,
            "worker pool started"
        );
        Ok(Self {
            queue: queue.to_string(),
            tracker,
            workers,
        })
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn state(&self) -> PoolState {
        self.tracker.state()
    }

    /// Deliveries currently being handled.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.tracker.in_flight_count()
    }

    /// Stops pulling deliveries, waits up to `drain_timeout` for in-flight
    /// ones to be settled, and joins the workers. Deliveries the consumer
    /// held but never handed to a worker return to the queue.
    ///
    /// Returns `false` if the drain timed out; unfinished workers are then
    /// aborted and their deliveries are redelivered by the broker.
    pub async fn shutdown(mut self, drain_timeout: Duration) -> bool {
        self.tracker.trigger_stop();
        let drained = self.tracker.wait_for_drain(drain_timeout).await;
        if drained {
            for worker in self.workers.drain(..) {
                log_exit(&self.queue, worker.await);
            }
            info!(queue = %self.queue, "worker pool drained");
        } else {
            warn!(
                queue = %self.queue,
                in_flight = self.tracker.in_flight_count(),
                "drain timeout expired; aborting workers"
            );
            for worker in self.workers.drain(..) {
                worker.abort();
            }
        }
        self.tracker.mark_stopped();
        drained
    }

    /// Waits until every worker has exited on its own, e.g. because the
    /// broker connection closed. Cancel-safe: workers not yet joined stay
    /// owned by the pool.
    pub async fn wait_exited(&mut self) {
        while let Some(worker) = self.workers.last_mut() {
            let exit = worker.await;
            self.workers.pop();
            log_exit(&self.queue, exit);
        }
        self.tracker.mark_stopped();
    }
}

fn log_exit(queue: &str, exit: Result<(), JoinError>) {
    match exit {
        Ok(()) => {}
        Err(err) if err.is_panic() => error!(queue = %queue, error = %err, "worker panicked"),
        Err(err) => debug!(queue = %queue, error = %err, "worker cancelled"),
    }
}

async fn run_worker(
    stream: SharedStream,
    mut service: DispatchService,
    broker: BrokerHandle,
    tracker: Arc<DrainTracker>,
) {
    let mut stop = tracker.stop_receiver();
    loop {
        let next = {
            let mut stream = tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                guard = stream.lock() => guard,
            };
            tokio::select! {
                biased;
                () = stopped(&mut stop) => break,
                item = stream.next() => item,
            }
        };

        match next {
            Some(Ok(delivery)) => {
                let _guard = tracker.in_flight_guard();
                process(delivery, &mut service, broker.as_ref()).await;
            }
            Some(Err(err)) => {
                warn!(error = %err, "delivery stream failed");
                break;
            }
            None => {
                debug!("delivery stream ended");
                break;
            }
        }
    }
}

async fn process(delivery: Delivery, service: &mut DispatchService, broker: &dyn Broker) {
    let inbound = Inbound::from_delivery(&delivery);
    let dispatch = async {
        match service.ready().await {
            Ok(ready) => ready.call(inbound).await,
            Err(err) => Err(err),
        }
    };
    let result = AssertUnwindSafe(dispatch)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(DispatchError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        });
    if let Err(err) = &result {
        match err {
            DispatchError::Unroutable { .. } => {
                warn!(error = %err, "unroutable delivery rejected");
            }
            DispatchError::Panicked { .. } => {
                error!(error = %err, "handler panicked; delivery dead-lettered");
            }
            _ => debug!(error = %err, redelivered = delivery.redelivered, "handler failed"),
        }
    }
    let decision = Decision::from_result(result, delivery.redelivered);
    settle(broker, delivery, decision).await;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
