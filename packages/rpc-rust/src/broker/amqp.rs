//! AMQP 0-9-1 broker over `lapin`.
//!
//! One connection per broker handle. Declarations run on short-lived
//! channels because a failed declaration closes its channel; publishing uses
//! a long-lived channel in publisher-confirm mode that is reopened after a
//! channel-level error; every consumer gets its own channel so `basic_qos`
//! applies to it alone and closing the channel cancels the consumer.
//!
//! The envelope travels as AMQP properties plus the raw body, so services
//! written against any AMQP client interoperate.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::Stream;
use lapin::acker::Acker;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use switchboard_core::{
    wire, Envelope, ExchangeDecl, ExchangeKind, Intent, QueueDecl, RoutingKey, WireError,
    JSON_CONTENT_TYPE,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Acknowledge, Broker, BrokerError, ConsumeOptions, Delivery, DeliveryStream};
use crate::config::BrokerConfig;

const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;
/// `Envelope::timestamp` is Unix milliseconds; the AMQP property is seconds.
const MILLIS_PER_SECOND: u64 = 1000;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn map_error(object: impl Into<String>, err: lapin::Error) -> BrokerError {
    match err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BrokerError::PreconditionFailed {
                    object: object.into(),
                    reason: amqp.get_message().as_str().to_string(),
                }
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BrokerError::NotFound {
                kind: "object",
                name: object.into(),
            },
            _ => BrokerError::Protocol(amqp.to_string()),
        },
        lapin::Error::InvalidConnectionState(_) => BrokerError::ConnectionClosed,
        other => BrokerError::Protocol(other.to_string()),
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

// ---------------------------------------------------------------------------
// Envelope <-> AMQP properties
// ---------------------------------------------------------------------------

fn queue_arguments(decl: &QueueDecl) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(target) = &decl.dead_letter {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(target.exchange.clone())),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(target.routing_key.clone())),
        );
    }
    args
}

fn properties(envelope: &Envelope) -> BasicProperties {
    let mut props =
        BasicProperties::default().with_content_type(ShortString::from(envelope.content_type.clone()));
    if let Some(id) = envelope.correlation_id() {
        props = props.with_correlation_id(ShortString::from(id.as_str().to_string()));
    }
    if let Intent::Request { reply_to, .. } = &envelope.intent {
        props = props.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(message_id) = &envelope.message_id {
        props = props.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(millis) = envelope.timestamp {
        props = props.with_timestamp(millis / MILLIS_PER_SECOND);
    }
    if envelope.persistent {
        props = props.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
    }
    props
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

fn envelope_from_parts(
    routing_key: &str,
    props: &BasicProperties,
    body: Vec<u8>,
) -> Result<Envelope, WireError> {
    let intent = wire::intent_from_parts(short(props.correlation_id()), short(props.reply_to()))?;
    Ok(Envelope {
        routing_key: RoutingKey::new(routing_key)?,
        intent,
        content_type: short(props.content_type()).unwrap_or_else(|| JSON_CONTENT_TYPE.to_string()),
        body: body.into(),
        persistent: *props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        message_id: short(props.message_id()),
        timestamp: props.timestamp().map(|secs| secs.saturating_mul(MILLIS_PER_SECOND)),
    })
}

// ---------------------------------------------------------------------------
// AmqpBroker
// ---------------------------------------------------------------------------

/// Broker handle over one AMQP connection.
pub struct AmqpBroker {
    connection: Connection,
    publisher: ArcSwap<Channel>,
    reopen: Mutex<()>,
}

impl AmqpBroker {
    /// Opens the connection and the publishing channel.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError` if the broker is unreachable or refuses the
    /// connection.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let mut props = ConnectionProperties::default();
        if !config.connection_name.is_empty() {
            props = props.with_connection_name(LongString::from(config.connection_name.clone()));
        }
        let connection = Connection::connect(&config.url, props)
            .await
            .map_err(|e| map_error("connection", e))?;
        let publisher = open_publisher(&connection).await?;
        info!(connection = %config.connection_name, "connected to AMQP broker");
        Ok(Self {
            connection,
            publisher: ArcSwap::from_pointee(publisher),
            reopen: Mutex::new(()),
        })
    }

    async fn declaration_channel(&self) -> Result<Channel, BrokerError> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| map_error("channel", e))
    }

    /// The publishing channel, reopened if a previous error closed it.
    async fn publisher(&self) -> Result<Arc<Channel>, BrokerError> {
        let current = self.publisher.load_full();
        if current.status().connected() {
            return Ok(current);
        }
        let _reopen = self.reopen.lock().await;
        let current = self.publisher.load_full();
        if current.status().connected() {
            return Ok(current);
        }
        if !self.connection.status().connected() {
            return Err(BrokerError::ConnectionClosed);
        }
        warn!("publishing channel closed; reopening");
        let channel = Arc::new(open_publisher(&self.connection).await?);
        self.publisher.store(Arc::clone(&channel));
        Ok(channel)
    }
}

async fn open_publisher(connection: &Connection) -> Result<Channel, BrokerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| map_error("channel", e))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| map_error("channel", e))?;
    Ok(channel)
}

async fn close_quietly(channel: &Channel) {
    if channel.status().connected() {
        if let Err(err) = channel.close(REPLY_SUCCESS, "done").await {
            debug!(error = %err, "channel close failed");
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, decl: &ExchangeDecl) -> Result<(), BrokerError> {
        let channel = self.declaration_channel().await?;
        let result = channel
            .exchange_declare(
                &decl.name,
                exchange_kind(decl.kind),
                ExchangeDeclareOptions {
                    durable: decl.durable,
                    auto_delete: decl.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(format!("exchange '{}'", decl.name), e));
        close_quietly(&channel).await;
        result
    }

    async fn declare_queue(&self, decl: &QueueDecl) -> Result<String, BrokerError> {
        let channel = self.declaration_channel().await?;
        let result = channel
            .queue_declare(
                &decl.name,
                QueueDeclareOptions {
                    durable: decl.durable,
                    exclusive: decl.exclusive,
                    auto_delete: decl.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(decl),
            )
            .await
            .map(|queue| queue.name().as_str().to_string())
            .map_err(|e| map_error(format!("queue '{}'", decl.name), e));
        close_quietly(&channel).await;
        result
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.declaration_channel().await?;
        let result = channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(format!("binding '{queue}' <- '{exchange}'"), e));
        close_quietly(&channel).await;
        result
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), BrokerError> {
        let channel = self.publisher().await?;
        let object = format!("exchange '{exchange}'");
        let confirm = channel
            .basic_publish(
                exchange,
                envelope.routing_key.as_str(),
                BasicPublishOptions::default(),
                &envelope.body,
                properties(&envelope),
            )
            .await
            .map_err(|e| map_error(object.clone(), e))?;
        let confirmation = confirm.await.map_err(|e| map_error(object, e))?;
        if confirmation.is_nack() {
            return Err(BrokerError::Protocol(format!(
                "broker refused message for '{}'",
                envelope.routing_key
            )));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        opts: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let channel = self.declaration_channel().await?;
        let object = format!("queue '{queue}'");
        if opts.prefetch > 0 {
            channel
                .basic_qos(opts.prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| map_error(object.clone(), e))?;
        }
        let consumer = channel
            .basic_consume(
                queue,
                &opts.consumer_tag,
                BasicConsumeOptions {
                    no_ack: opts.no_ack,
                    exclusive: opts.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(object, e))?;
        debug!(queue, prefetch = opts.prefetch, no_ack = opts.no_ack, "consumer attached");
        Ok(Box::pin(AmqpDeliveries {
            consumer: Box::pin(consumer),
            channel: Some(channel),
            no_ack: opts.no_ack,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        match self.connection.close(REPLY_SUCCESS, "normal shutdown").await {
            Ok(()) | Err(lapin::Error::InvalidConnectionState(_)) => Ok(()),
            Err(err) => Err(map_error("connection", err)),
        }
    }
}

// ---------------------------------------------------------------------------
// Consumer stream and acknowledger
// ---------------------------------------------------------------------------

type RawDeliveries = Pin<Box<dyn Stream<Item = lapin::Result<AmqpDelivery>> + Send>>;

struct AmqpDeliveries {
    consumer: RawDeliveries,
    /// Closed on drop, which cancels the consumer and requeues its unacked
    /// deliveries.
    channel: Option<Channel>,
    no_ack: bool,
}

impl Stream for AmqpDeliveries {
    type Item = Result<Delivery, BrokerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let raw = match this.consumer.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(map_error("consumer", err))))
                }
                Poll::Ready(Some(Ok(raw))) => raw,
            };
            match envelope_from_parts(raw.routing_key.as_str(), &raw.properties, raw.data) {
                Ok(envelope) => {
                    let acker: Option<Box<dyn Acknowledge>> = if this.no_ack {
                        None
                    } else {
                        Some(Box::new(AmqpAcker(raw.acker)))
                    };
                    return Poll::Ready(Some(Ok(Delivery::new(
                        envelope,
                        raw.delivery_tag,
                        raw.redelivered,
                        acker,
                    ))));
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        routing_key = raw.routing_key.as_str(),
                        "malformed delivery discarded"
                    );
                    if !this.no_ack {
                        let acker = raw.acker;
                        tokio::spawn(async move {
                            if let Err(err) =
                                acker.reject(BasicRejectOptions { requeue: false }).await
                            {
                                warn!(error = %err, "failed to reject malformed delivery");
                            }
                        });
                    }
                }
            }
        }
    }
}

impl Drop for AmqpDeliveries {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { close_quietly(&channel).await });
        }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| map_error("delivery", e))
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| map_error("delivery", e))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
