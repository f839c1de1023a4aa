//! In-process reference broker.
//!
//! Implements the subset of AMQP 0-9-1 semantics the messaging core relies on:
//!
//! - direct, topic, and fanout exchanges plus the default exchange
//! - durable/exclusive/auto-delete queues, server-named queues
//! - conflicting redeclarations fail with `PreconditionFailed`
//! - per-consumer prefetch, round-robin distribution across consumers
//! - `reject(requeue = true)` puts the message back with `redelivered` set,
//!   `reject(requeue = false)` dead-letters it if the queue has a target
//! - a dropped consumer's unacked deliveries are requeued; an auto-delete
//!   queue disappears with its last consumer
//!
//! Frames are stored wire-encoded, so every message crosses the codec.
//! Dead-lettered frames keep their original envelope; only the routing used
//! to reach the dead-letter queue changes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use switchboard_core::{wire, Envelope, ExchangeDecl, QueueDecl};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    Acknowledge, Broker, BrokerError, ConsumeOptions, Delivery, DeliveryStream, DEFAULT_EXCHANGE,
};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BrokerError>>;

// ---------------------------------------------------------------------------
// Introspection types
// ---------------------------------------------------------------------------

/// Counters for one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Messages waiting for a consumer.
    pub ready: usize,
    /// Messages delivered and not yet settled.
    pub unacked: usize,
    pub consumers: usize,
}

/// Declared objects and bindings, for comparing broker states.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologySnapshot {
    pub exchanges: BTreeMap<String, ExchangeDecl>,
    pub queues: BTreeMap<String, QueueDecl>,
    /// `(exchange, queue, routing_key)` triples.
    pub bindings: BTreeSet<(String, String, String)>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Frame {
    bytes: Bytes,
    redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeEntry {
    decl: ExchangeDecl,
    bindings: Vec<Binding>,
}

struct ConsumerEntry {
    id: u64,
    opts: ConsumeOptions,
    outstanding: usize,
    tx: DeliverySender,
}

impl ConsumerEntry {
    fn has_capacity(&self) -> bool {
        self.opts.no_ack
            || self.opts.prefetch == 0
            || self.outstanding < usize::from(self.opts.prefetch)
    }
}

struct Unacked {
    consumer_id: u64,
    frame: Frame,
}

struct QueueEntry {
    decl: QueueDecl,
    ready: VecDeque<Frame>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

impl QueueEntry {
    fn new(decl: QueueDecl) -> Self {
        Self {
            decl,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Next consumer with spare prefetch capacity, round-robin.
    fn pick_consumer(&mut self) -> Option<usize> {
        let len = self.consumers.len();
        for offset in 0..len {
            let idx = (self.cursor + offset) % len;
            let consumer = &self.consumers[idx];
            if consumer.has_capacity() && !consumer.tx.is_closed() {
                self.cursor = (idx + 1) % len;
                return Some(idx);
            }
        }
        None
    }

    fn settle(&mut self, tag: u64) -> Result<Frame, BrokerError> {
        let unacked = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| BrokerError::Protocol(format!("unknown delivery tag {tag}")))?;
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|c| c.id == unacked.consumer_id)
        {
            consumer.outstanding = consumer.outstanding.saturating_sub(1);
        }
        Ok(unacked.frame)
    }

    /// Puts every unacked frame of `consumer_id` back at the head of the
    /// queue, preserving delivery order.
    fn requeue_unacked_of(&mut self, consumer_id: Option<u64>) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| consumer_id.is_none_or(|id| u.consumer_id == id))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(mut unacked) = self.unacked.remove(&tag) {
                unacked.frame.redelivered = true;
                self.ready.push_front(unacked.frame);
            }
        }
    }
}

struct State {
    self_ref: Weak<Mutex<State>>,
    connected: bool,
    exchanges: HashMap<String, ExchangeEntry>,
    queues: HashMap<String, QueueEntry>,
    next_consumer_id: u64,
    next_delivery_tag: u64,
}

impl State {
    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    /// Routes a frame and returns the queues it landed in.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        frame: &Frame,
    ) -> Result<Vec<String>, BrokerError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let entry = self.exchanges.get(exchange).ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &entry.bindings {
                if entry.decl.kind.routes(&binding.routing_key, routing_key)
                    && !targets.contains(&binding.queue)
                {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        let mut delivered = Vec::with_capacity(targets.len());
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(frame.clone());
                delivered.push(name);
            }
        }
        if delivered.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        Ok(delivered)
    }

    /// Hands ready frames to consumers with spare capacity.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        while !queue.ready.is_empty() {
            let Some(idx) = queue.pick_consumer() else {
                break;
            };
            let Some(frame) = queue.ready.pop_front() else {
                break;
            };
            let envelope = match wire::decode(&frame.bytes) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(queue = queue_name, error = %err, "dropping undecodable frame");
                    continue;
                }
            };

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let consumer = &mut queue.consumers[idx];
            let acker: Option<Box<dyn Acknowledge>> = if consumer.opts.no_ack {
                None
            } else {
                Some(Box::new(MemoryAcker {
                    state: self.self_ref.clone(),
                    queue: queue_name.to_string(),
                    tag,
                }))
            };
            let delivery = Delivery::new(envelope, tag, frame.redelivered, acker);

            if consumer.tx.send(Ok(delivery)).is_ok() {
                if !consumer.opts.no_ack {
                    consumer.outstanding += 1;
                    queue.unacked.insert(
                        tag,
                        Unacked {
                            consumer_id: consumer.id,
                            frame,
                        },
                    );
                }
            } else {
                queue.consumers.remove(idx);
                queue.cursor = 0;
                queue.ready.push_front(frame);
            }
        }
    }

    fn settle(&mut self, queue_name: &str, tag: u64, outcome: Settle) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let queue = self.queues.get_mut(queue_name).ok_or_else(|| BrokerError::NotFound {
            kind: "queue",
            name: queue_name.to_string(),
        })?;
        let mut frame = queue.settle(tag)?;
        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                frame.redelivered = true;
                queue.ready.push_front(frame);
            }
            Settle::DeadLetter => {
                if let Some(target) = queue.decl.dead_letter.clone() {
                    frame.redelivered = false;
                    match self.route(&target.exchange, &target.routing_key, &frame) {
                        Ok(landed) => {
                            for name in landed {
                                self.dispatch(&name);
                            }
                        }
                        Err(err) => debug!(
                            queue = %queue_name,
                            exchange = %target.exchange,
                            error = %err,
                            "dead-letter exchange unavailable; dropping message"
                        ),
                    }
                }
            }
        }
        self.dispatch(queue_name);
        Ok(())
    }

    fn cancel_consumer(&mut self, queue_name: &str, consumer_id: u64) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.consumers.retain(|c| c.id != consumer_id);
        queue.cursor = 0;
        queue.requeue_unacked_of(Some(consumer_id));
        if queue.decl.auto_delete && queue.consumers.is_empty() {
            self.delete_queue(queue_name);
            return;
        }
        self.dispatch(queue_name);
    }

    fn delete_queue(&mut self, queue_name: &str) {
        self.queues.remove(queue_name);
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != queue_name);
        }
        debug!(queue = queue_name, "queue deleted");
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    DeadLetter,
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|self_ref| {
            Mutex::new(State {
                self_ref: self_ref.clone(),
                connected: true,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                next_consumer_id: 0,
                next_delivery_tag: 0,
            })
        });
        Self { state }
    }

    /// Simulates connection loss: every consumer stream ends, exclusive
    /// queues are deleted, unacked messages are requeued, and later calls
    /// fail with `ConnectionClosed`.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        let mut exclusive = Vec::new();
        for (name, queue) in &mut state.queues {
            queue.consumers.clear();
            queue.requeue_unacked_of(None);
            if queue.decl.exclusive {
                exclusive.push(name.clone());
            }
        }
        for name in exclusive {
            state.delete_queue(&name);
        }
    }

    /// Counters for `queue`, or `None` if it does not exist.
    #[must_use]
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.state.lock();
        state.queues.get(queue).map(|q| QueueStats {
            ready: q.ready.len(),
            unacked: q.unacked.len(),
            consumers: q.consumers.len(),
        })
    }

    /// Declared objects and bindings.
    #[must_use]
    pub fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.lock();
        let mut snapshot = TopologySnapshot::default();
        for (name, exchange) in &state.exchanges {
            snapshot
                .exchanges
                .insert(name.clone(), exchange.decl.clone());
            for binding in &exchange.bindings {
                snapshot.bindings.insert((
                    name.clone(),
                    binding.queue.clone(),
                    binding.routing_key.clone(),
                ));
            }
        }
        for (name, queue) in &state.queues {
            snapshot.queues.insert(name.clone(), queue.decl.clone());
        }
        snapshot
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, decl: &ExchangeDecl) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        if decl.name == DEFAULT_EXCHANGE {
            return Err(BrokerError::Protocol(
                "the default exchange cannot be declared".to_string(),
            ));
        }
        match state.exchanges.get(&decl.name) {
            Some(existing) if existing.decl != *decl => Err(BrokerError::PreconditionFailed {
                object: format!("exchange '{}'", decl.name),
                reason: format!("requested {decl:?}, existing {:?}", existing.decl),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    decl.name.clone(),
                    ExchangeEntry {
                        decl: decl.clone(),
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, decl: &QueueDecl) -> Result<String, BrokerError> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        let mut decl = decl.clone();
        if decl.is_server_named() {
            decl.name = format!("amq.gen-{}", uuid::Uuid::new_v4().simple());
        }
        match state.queues.get(&decl.name) {
            Some(existing) if existing.decl != decl => Err(BrokerError::PreconditionFailed {
                object: format!("queue '{}'", decl.name),
                reason: format!("requested {decl:?}, existing {:?}", existing.decl),
            }),
            Some(_) => Ok(decl.name),
            None => {
                let name = decl.name.clone();
                state.queues.insert(name.clone(), QueueEntry::new(decl));
                Ok(name)
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound {
                kind: "queue",
                name: queue.to_string(),
            });
        }
        let entry = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound {
                kind: "exchange",
                name: exchange.to_string(),
            })?;
        let binding = Binding {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !entry.bindings.contains(&binding) {
            entry.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError> {
        let frame = Frame {
            bytes: Bytes::from(wire::encode(&envelope)?),
            redelivered: false,
        };
        let mut state = self.state.lock();
        state.ensure_connected()?;
        let landed = state.route(exchange, envelope.routing_key.as_str(), &frame)?;
        for name in landed {
            state.dispatch(&name);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        opts: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state.lock();
        state.ensure_connected()?;
        state.next_consumer_id += 1;
        let consumer_id = state.next_consumer_id;
        let entry = state.queues.get_mut(queue).ok_or_else(|| BrokerError::NotFound {
            kind: "queue",
            name: queue.to_string(),
        })?;
        if entry.decl.exclusive && !entry.consumers.is_empty() {
            return Err(BrokerError::Protocol(format!(
                "exclusive queue '{queue}' already has a consumer"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        entry.consumers.push(ConsumerEntry {
            id: consumer_id,
            opts,
            outstanding: 0,
            tx,
        });
        state.dispatch(queue);

        Ok(Box::pin(MemoryConsumer {
            rx,
            state: Arc::downgrade(&self.state),
            queue: queue.to_string(),
            consumer_id,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.disconnect();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer stream and acknowledger
// ---------------------------------------------------------------------------

struct MemoryConsumer {
    rx: mpsc::UnboundedReceiver<Result<Delivery, BrokerError>>,
    state: Weak<Mutex<State>>,
    queue: String,
    consumer_id: u64,
}

impl Stream for MemoryConsumer {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().cancel_consumer(&self.queue, self.consumer_id);
        }
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), BrokerError> {
        let state = self.state.upgrade().ok_or(BrokerError::ConnectionClosed)?;
        let mut state = state.lock();
        state.settle(&self.queue, self.tag, outcome)
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(if requeue {
            Settle::Requeue
        } else {
            Settle::DeadLetter
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
