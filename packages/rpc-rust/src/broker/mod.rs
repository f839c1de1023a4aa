//! Broker abstraction.
//!
//! The messaging core talks to the broker only through the [`Broker`] trait:
//! declare objects, publish envelopes, and consume a lazy stream of
//! [`Delivery`] values. Two implementations exist:
//!
//! - [`memory::InMemoryBroker`]: in-process reference broker, always available
//! - `amqp::AmqpBroker`: AMQP 0-9-1 via `lapin` (feature `amqp`)

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use switchboard_core::{Envelope, ExchangeDecl, QueueDecl, WireError};

use crate::config::BrokerConfig;

pub use memory::InMemoryBroker;

/// Name of the broker's default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by a broker implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// A declaration conflicts with an existing, differently configured object.
    #[error("{object} conflicts with existing broker state: {reason}")]
    PreconditionFailed { object: String, reason: String },
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("broker connection closed")]
    ConnectionClosed,
    #[error("wire format error: {0}")]
    Wire(Arc<WireError>),
    #[error("broker protocol error: {0}")]
    Protocol(String),
    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),
}

impl BrokerError {
    /// Whether this error is a configuration conflict rather than a
    /// transient fault.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, BrokerError::PreconditionFailed { .. })
    }
}

impl From<WireError> for BrokerError {
    fn from(err: WireError) -> Self {
        BrokerError::Wire(Arc::new(err))
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A received message plus the broker metadata needed to settle it.
///
/// `ack` and `reject` take `self`, so a delivery reaches exactly one terminal
/// state. Deliveries from `no_ack` consumers carry no acknowledger and settle
/// as no-ops.
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    /// The broker delivered this message before and it was requeued.
    pub redelivered: bool,
    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    #[must_use]
    pub fn new(
        envelope: Envelope,
        delivery_tag: u64,
        redelivered: bool,
        acker: Option<Box<dyn Acknowledge>>,
    ) -> Self {
        Self {
            envelope,
            delivery_tag,
            redelivered,
            acker,
        }
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` if the broker refuses the acknowledgment.
    pub async fn ack(self) -> Result<(), BrokerError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Rejects the delivery, requeueing it or dead-lettering it.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` if the broker refuses the rejection.
    pub async fn reject(self, requeue: bool) -> Result<(), BrokerError> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("acked_by_broker", &self.acker.is_none())
            .finish()
    }
}

/// Lazy sequence of deliveries for one consumer. Dropping it cancels the
/// consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum unacknowledged deliveries outstanding for this consumer.
    /// Zero means unbounded.
    pub prefetch: u16,
    /// The broker considers messages settled on send.
    pub no_ack: bool,
    pub exclusive: bool,
    pub consumer_tag: String,
}

impl ConsumeOptions {
    /// Manual acknowledgment with the given prefetch bound.
    #[must_use]
    pub fn work_queue(prefetch: u16, consumer_tag: impl Into<String>) -> Self {
        Self {
            prefetch,
            no_ack: false,
            exclusive: false,
            consumer_tag: consumer_tag.into(),
        }
    }

    /// Exclusive auto-ack consumer for a reply queue.
    #[must_use]
    pub fn reply_queue() -> Self {
        Self {
            prefetch: 0,
            no_ack: true,
            exclusive: true,
            consumer_tag: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

/// Connection to a message broker.
///
/// Implementations must be safe to share across tasks: callers, workers, and
/// the reply dispatcher all hold the same `Arc<dyn Broker>`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange. Redeclaring an identical exchange is a no-op.
    async fn declare_exchange(&self, decl: &ExchangeDecl) -> Result<(), BrokerError>;

    /// Declares a queue and returns its name (broker-generated if
    /// `decl.name` is empty). Redeclaring an identical queue is a no-op.
    async fn declare_queue(&self, decl: &QueueDecl) -> Result<String, BrokerError>;

    /// Binds a queue to an exchange. Binding twice is a no-op.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes an envelope. `exchange` may be [`DEFAULT_EXCHANGE`], which
    /// routes to the queue named by the envelope's routing key.
    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError>;

    /// Starts a consumer on `queue`.
    async fn consume(&self, queue: &str, opts: ConsumeOptions)
        -> Result<DeliveryStream, BrokerError>;

    /// Closes the connection. Open delivery streams end.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Shared broker handle.
pub type BrokerHandle = Arc<dyn Broker>;

/// Connects to the broker named by `config.url`.
///
/// `memory://` yields a fresh [`InMemoryBroker`]; `amqp://` and `amqps://`
/// require the `amqp` feature.
///
/// # Errors
///
/// Returns `BrokerError::UnsupportedUrl` for unknown schemes, or the
/// connection error from the broker.
pub async fn connect(config: &BrokerConfig) -> Result<BrokerHandle, BrokerError> {
    let url = config.url.as_str();
    if url.starts_with("memory://") {
        return Ok(Arc::new(InMemoryBroker::new()));
    }
    if url.starts_with("amqp://") || url.starts_with("amqps://") {
        #[cfg(feature = "amqp")]
        {
            let broker = amqp::AmqpBroker::connect(config).await?;
            return Ok(Arc::new(broker));
        }
        #[cfg(not(feature = "amqp"))]
        {
            return Err(BrokerError::UnsupportedUrl(format!(
                "{url} (built without the `amqp` feature)"
            )));
        }
    }
    Err(BrokerError::UnsupportedUrl(url.to_string()))
}
