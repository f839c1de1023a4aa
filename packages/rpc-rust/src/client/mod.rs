//! RPC client: synchronous call emulation over the broker.
//!
//! A call publishes a request carrying a fresh correlation id and a reply
//! address, then waits for the reply with the same id or for its deadline.
//! Replies are received through one of two [`ReplyStrategy`] variants:
//!
//! - `Shared`: one exclusive reply queue per client and a single dispatcher
//!   task that routes each reply to its waiter through [`PendingCalls`]
//! - `PerCall`: a fresh exclusive auto-delete queue per call; replies with a
//!   foreign correlation id are skipped
//!
//! A timeout means the outcome is unknown: the responder may still process
//! the request. Calls are never retried here.

pub mod pending;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use switchboard_core::{CorrelationId, Envelope, QueueDecl, ReplyBody, RoutingKey};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, warn, Instrument};

use crate::broker::{BrokerError, BrokerHandle, ConsumeOptions, DeliveryStream};
use crate::config::{ClientConfig, ReplyStrategy};

pub use pending::{PendingCalls, PendingGuard};

/// Why a call produced no reply.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// No reply before the deadline. The request may still be processed.
    #[error("no reply within {timeout_ms}ms; outcome unknown")]
    Timeout { timeout_ms: u64 },
    /// The reply stream ended while the call was waiting.
    #[error("broker connection lost while awaiting reply")]
    ConnectionLost,
    #[error("transport error: {0}")]
    Transport(#[from] BrokerError),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CallError {
    /// Metric label for this outcome.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            CallError::Timeout { .. } => "timeout",
            CallError::ConnectionLost => "connection_lost",
            CallError::Transport(_) => "transport",
            CallError::Encode(_) => "encode",
            CallError::Decode(_) => "decode",
        }
    }
}

fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

enum ReplyChannel {
    Shared {
        queue: String,
        pending: Arc<PendingCalls>,
        dispatcher: JoinHandle<()>,
    },
    PerCall,
}

struct Inner {
    broker: BrokerHandle,
    config: ClientConfig,
    replies: ReplyChannel,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let ReplyChannel::Shared { dispatcher, .. } = &self.replies {
            dispatcher.abort();
        }
    }
}

/// Request/reply client. Cheap to clone; clones share the reply channel.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Creates a client. With the shared strategy this declares the reply
    /// queue and starts the reply dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` if the reply queue cannot be declared or
    /// consumed.
    pub async fn connect(broker: BrokerHandle, config: ClientConfig) -> Result<Self, BrokerError> {
        let replies = match config.reply_strategy {
            ReplyStrategy::Shared => {
                let queue = broker.declare_queue(&QueueDecl::reply()).await?;
                let stream = broker.consume(&queue, ConsumeOptions::reply_queue()).await?;
                let pending = Arc::new(PendingCalls::new());
                let dispatcher = tokio::spawn(
                    dispatch_replies(stream, Arc::clone(&pending))
                        .instrument(debug_span!("reply_dispatcher", queue = %queue)),
                );
                debug!(queue = %queue, "shared reply queue ready");
                ReplyChannel::Shared {
                    queue,
                    pending,
                    dispatcher,
                }
            }
            ReplyStrategy::PerCall => ReplyChannel::PerCall,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                broker,
                config,
                replies,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Deadline used when the caller does not supply one.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.inner.config.default_timeout()
    }

    /// Name of the shared reply queue, if this client uses one.
    #[must_use]
    pub fn reply_queue(&self) -> Option<&str> {
        match &self.inner.replies {
            ReplyChannel::Shared { queue, .. } => Some(queue),
            ReplyChannel::PerCall => None,
        }
    }

    /// Calls awaiting a reply on the shared queue.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        match &self.inner.replies {
            ReplyChannel::Shared { pending, .. } => pending.len(),
            ReplyChannel::PerCall => 0,
        }
    }

    /// Publishes a request to `routing_key` and waits up to `timeout` for
    /// the matching reply body.
    ///
    /// # Errors
    ///
    /// `Timeout` when no reply arrives in time, `ConnectionLost` when the
    /// reply stream ends first, `Transport` when publishing fails.
    pub async fn call(
        &self,
        routing_key: &RoutingKey,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, CallError> {
        let correlation_id = CorrelationId::generate();
        let span = debug_span!(
            "rpc_call",
            routing_key = %routing_key,
            correlation_id = %correlation_id,
        );
        let result = async {
            match &self.inner.replies {
                ReplyChannel::Shared { queue, pending, .. } => {
                    self.call_shared(routing_key, payload, timeout, correlation_id, queue, pending)
                        .await
                }
                ReplyChannel::PerCall => {
                    self.call_per_call(routing_key, payload, timeout, correlation_id)
                        .await
                }
            }
        }
        .instrument(span)
        .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.label(),
        };
        metrics::counter!("switchboard_calls_total", "outcome" => outcome).increment(1);
        if let Err(err) = &result {
            debug!(routing_key = %routing_key, error = %err, "call failed");
        }
        result
    }

    /// Serializes `request` as JSON, calls, and decodes the reply as a
    /// [`ReplyBody`]. An error status in the body is a normal response.
    ///
    /// # Errors
    ///
    /// As [`RpcClient::call`], plus `Encode` and `Decode`.
    pub async fn call_json<T: Serialize + ?Sized>(
        &self,
        routing_key: &RoutingKey,
        request: &T,
        timeout: Duration,
    ) -> Result<ReplyBody, CallError> {
        let payload = serde_json::to_vec(request).map_err(CallError::Encode)?;
        let reply = self.call(routing_key, Bytes::from(payload), timeout).await?;
        ReplyBody::from_slice(&reply).map_err(CallError::Decode)
    }

    /// Publishes a fire-and-forget message.
    ///
    /// # Errors
    ///
    /// Returns `Transport` if the broker refuses the publish.
    pub async fn notify(&self, routing_key: &RoutingKey, payload: Bytes) -> Result<(), CallError> {
        let envelope = Envelope::notify(routing_key.clone(), payload)
            .with_persistent(self.inner.config.persistent);
        self.inner
            .broker
            .publish(&self.inner.config.exchange, envelope)
            .await?;
        metrics::counter!("switchboard_calls_total", "outcome" => "notified").increment(1);
        Ok(())
    }

    fn request(
        &self,
        routing_key: &RoutingKey,
        payload: Bytes,
        correlation_id: CorrelationId,
        reply_to: &str,
    ) -> Envelope {
        Envelope::request(routing_key.clone(), payload, correlation_id, reply_to)
            .with_persistent(self.inner.config.persistent)
    }

    async fn call_shared(
        &self,
        routing_key: &RoutingKey,
        payload: Bytes,
        timeout: Duration,
        correlation_id: CorrelationId,
        queue: &str,
        pending: &Arc<PendingCalls>,
    ) -> Result<Bytes, CallError> {
        // Registered before publishing so an immediate reply finds its waiter.
        let (_guard, slot) = pending.register(correlation_id.clone())?;
        let envelope = self.request(routing_key, payload, correlation_id, queue);

        let exchange = self.inner.config.exchange.as_str();
        let exchange_call = async {
            self.inner.broker.publish(exchange, envelope).await?;
            match slot.await {
                Ok(result) => result,
                Err(_) => Err(CallError::ConnectionLost),
            }
        };
        match tokio::time::timeout(timeout, exchange_call).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout {
                timeout_ms: timeout_ms(timeout),
            }),
        }
    }

    async fn call_per_call(
        &self,
        routing_key: &RoutingKey,
        payload: Bytes,
        timeout: Duration,
        correlation_id: CorrelationId,
    ) -> Result<Bytes, CallError> {
        let broker = &self.inner.broker;
        let exchange_call = async {
            let queue = broker.declare_queue(&QueueDecl::reply()).await?;
            let mut stream = broker.consume(&queue, ConsumeOptions::reply_queue()).await?;
            let envelope = self.request(routing_key, payload, correlation_id.clone(), &queue);
            broker.publish(&self.inner.config.exchange, envelope).await?;
            await_reply(&mut stream, &correlation_id).await
        };
        match tokio::time::timeout(timeout, exchange_call).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout {
                timeout_ms: timeout_ms(timeout),
            }),
        }
    }
}

/// Reads `stream` until a reply carrying `id` arrives.
async fn await_reply(stream: &mut DeliveryStream, id: &CorrelationId) -> Result<Bytes, CallError> {
    while let Some(delivery) = stream.next().await {
        let envelope = delivery?.envelope;
        if envelope.correlation_id() == Some(id) {
            return Ok(envelope.body);
        }
        debug!(
            correlation_id = ?envelope.correlation_id().map(CorrelationId::as_str),
            "skipping reply for another call"
        );
    }
    Err(CallError::ConnectionLost)
}

/// Routes replies from the shared queue to their waiters until the stream
/// ends, then fails whatever is still waiting.
async fn dispatch_replies(mut stream: DeliveryStream, pending: Arc<PendingCalls>) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => {
                let envelope = delivery.envelope;
                match envelope.correlation_id() {
                    Some(id) => {
                        if !pending.resolve(id, envelope.body.clone()) {
                            debug!(correlation_id = %id, "reply for unknown or expired call dropped");
                        }
                    }
                    None => debug!("reply without correlation id dropped"),
                }
            }
            Err(err) => {
                warn!(error = %err, "reply stream failed");
                break;
            }
        }
    }
    pending.fail_all();
    debug!("reply dispatcher stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use switchboard_core::{ExchangeDecl, ExchangeKind, Intent};
    use tokio::time::Instant;

    use super::*;
    use crate::broker::{Broker, InMemoryBroker, DEFAULT_EXCHANGE};

    const EXCHANGE: &str = "svc.exchange";
    const QUEUE: &str = "svc_queue";

    fn key(s: &str) -> RoutingKey {
        RoutingKey::new(s).unwrap()
    }

    fn client_config(strategy: ReplyStrategy) -> ClientConfig {
        ClientConfig {
            exchange: EXCHANGE.to_string(),
            reply_strategy: strategy,
            ..ClientConfig::default()
        }
    }

    async fn setup() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDecl::durable(EXCHANGE, ExchangeKind::Topic))
            .await
            .unwrap();
        broker.declare_queue(&QueueDecl::durable(QUEUE)).await.unwrap();
        broker.bind_queue(QUEUE, EXCHANGE, "svc.#").await.unwrap();
        broker
    }

    /// Echoes every request after a short payload-dependent delay, so
    /// replies complete out of order. With `stray`, a reply carrying a
    /// foreign correlation id is published first.
    fn spawn_echo(broker: InMemoryBroker, stray: bool) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = broker
                .consume(QUEUE, ConsumeOptions::work_queue(0, "echo"))
                .await
                .unwrap();
            while let Some(Ok(delivery)) = stream.next().await {
                let broker = broker.clone();
                tokio::spawn(async move {
                    let request = delivery.envelope.clone();
                    let delay = request.body.len() as u64 % 7;
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if stray {
                        let foreign = Envelope {
                            intent: Intent::Reply {
                                correlation_id: CorrelationId::generate(),
                            },
                            ..request.reply(Bytes::from_static(b"not yours")).unwrap()
                        };
                        broker.publish(DEFAULT_EXCHANGE, foreign).await.unwrap();
                    }
                    let reply = request.reply(request.body.clone()).unwrap();
                    broker.publish(DEFAULT_EXCHANGE, reply).await.unwrap();
                    delivery.ack().await.unwrap();
                });
            }
        })
    }

    #[tokio::test]
    async fn concurrent_calls_receive_their_own_replies() {
        for strategy in [ReplyStrategy::Shared, ReplyStrategy::PerCall] {
            let broker = setup().await;
            let _echo = spawn_echo(broker.clone(), false);
            let client = RpcClient::connect(Arc::new(broker), client_config(strategy))
                .await
                .unwrap();

            let calls = (0..50).map(|i| {
                let client = client.clone();
                async move {
                    let payload = Bytes::from(format!("payload-{i}-{}", "x".repeat(i)));
                    let reply = client
                        .call(&key("svc.echo"), payload.clone(), Duration::from_secs(5))
                        .await
                        .unwrap();
                    assert_eq!(reply, payload);
                    reply
                }
            });
            let replies = futures_util::future::join_all(calls).await;
            let distinct: HashSet<_> = replies.into_iter().collect();
            assert_eq!(distinct.len(), 50);
            assert_eq!(client.pending_count(), 0);
        }
    }

    #[tokio::test]
    async fn foreign_correlation_ids_are_ignored() {
        for strategy in [ReplyStrategy::Shared, ReplyStrategy::PerCall] {
            let broker = setup().await;
            let _echo = spawn_echo(broker.clone(), true);
            let client = RpcClient::connect(Arc::new(broker), client_config(strategy))
                .await
                .unwrap();

            let reply = client
                .call(&key("svc.echo"), Bytes::from_static(b"mine"), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(reply, Bytes::from_static(b"mine"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_at_deadline() {
        for strategy in [ReplyStrategy::Shared, ReplyStrategy::PerCall] {
            let broker = setup().await;
            let client = RpcClient::connect(Arc::new(broker.clone()), client_config(strategy))
                .await
                .unwrap();

            let started = Instant::now();
            let err = client
                .call(&key("svc.silent"), Bytes::new(), Duration::from_secs(5))
                .await
                .unwrap_err();
            let elapsed = started.elapsed();

            assert!(matches!(err, CallError::Timeout { timeout_ms: 5000 }));
            assert!(elapsed >= Duration::from_secs(5));
            assert!(elapsed < Duration::from_millis(5_050));
            assert_eq!(client.pending_count(), 0);
            // The request is still queued: the outcome is unknown, not failed.
            assert_eq!(broker.queue_stats(QUEUE).unwrap().ready, 1);
        }
    }

    #[tokio::test]
    async fn late_reply_is_dropped_and_client_keeps_working() {
        let broker = setup().await;
        let client = RpcClient::connect(
            Arc::new(broker.clone()),
            client_config(ReplyStrategy::Shared),
        )
        .await
        .unwrap();

        let err = client
            .call(&key("svc.slow"), Bytes::new(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout { .. }));

        // Answer the expired request now; nobody is waiting for it.
        let mut stream = broker
            .consume(QUEUE, ConsumeOptions::work_queue(1, "late"))
            .await
            .unwrap();
        let stale = stream.next().await.unwrap().unwrap();
        let reply = stale.envelope.reply(Bytes::from_static(b"late")).unwrap();
        broker.publish(DEFAULT_EXCHANGE, reply).await.unwrap();
        stale.ack().await.unwrap();
        drop(stream);

        let _echo = spawn_echo(broker.clone(), false);
        let reply = client
            .call(&key("svc.echo"), Bytes::from_static(b"fresh"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn connection_loss_fails_waiting_calls() {
        for strategy in [ReplyStrategy::Shared, ReplyStrategy::PerCall] {
            let broker = setup().await;
            let client = RpcClient::connect(Arc::new(broker.clone()), client_config(strategy))
                .await
                .unwrap();

            let call = tokio::spawn({
                let client = client.clone();
                async move {
                    client
                        .call(&key("svc.hang"), Bytes::new(), Duration::from_secs(30))
                        .await
                }
            });
            while broker.queue_stats(QUEUE).unwrap().ready == 0 {
                tokio::task::yield_now().await;
            }
            broker.disconnect();

            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, CallError::ConnectionLost), "{strategy:?}: {err}");
        }
    }

    #[tokio::test]
    async fn handler_error_reply_is_a_normal_response() {
        let broker = setup().await;
        let responder = broker.clone();
        tokio::spawn(async move {
            let mut stream = responder
                .consume(QUEUE, ConsumeOptions::work_queue(1, "err"))
                .await
                .unwrap();
            let delivery = stream.next().await.unwrap().unwrap();
            let body = ReplyBody::error("grade file is empty").to_bytes();
            let reply = delivery.envelope.reply(body).unwrap();
            responder.publish(DEFAULT_EXCHANGE, reply).await.unwrap();
            delivery.ack().await.unwrap();
        });

        let client = RpcClient::connect(Arc::new(broker), client_config(ReplyStrategy::Shared))
            .await
            .unwrap();
        let body = client
            .call_json(
                &key("svc.postgrades.init"),
                &serde_json::json!({ "file": "grades.xlsx" }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(!body.is_ok());
        assert_eq!(body.failure_text(), Some("grade file is empty"));
    }

    #[tokio::test]
    async fn notify_publishes_without_reply_address() {
        let broker = setup().await;
        let mut stream = broker
            .consume(QUEUE, ConsumeOptions::work_queue(1, "n"))
            .await
            .unwrap();
        let client = RpcClient::connect(
            Arc::new(broker.clone()),
            client_config(ReplyStrategy::PerCall),
        )
        .await
        .unwrap();

        client
            .notify(&key("svc.credits.spent"), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.intent, Intent::Notify);
        assert!(delivery.envelope.persistent);
    }

    #[tokio::test]
    async fn correlation_ids_are_fresh_per_call() {
        let broker = setup().await;
        let mut stream = broker
            .consume(QUEUE, ConsumeOptions::work_queue(0, "ids"))
            .await
            .unwrap();
        let client = RpcClient::connect(
            Arc::new(broker.clone()),
            client_config(ReplyStrategy::Shared),
        )
        .await
        .unwrap();
        for _ in 0..2 {
            let _ = client
                .call(&key("svc.x"), Bytes::new(), Duration::from_millis(5))
                .await;
        }
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_ne!(first.envelope.correlation_id(), second.envelope.correlation_id());
        assert_eq!(
            first.envelope.intent.reply_to(),
            client.reply_queue(),
            "requests name the shared reply queue"
        );
    }
}
