//! Delivery disposition: what happens to a delivery once its handler ran.
//!
//! | dispatch result                          | reply (requests) | settlement        |
//! |------------------------------------------|------------------|-------------------|
//! | success                                  | handler payload  | ack               |
//! | unknown routing key                      | error body       | reject, no requeue|
//! | retryable error, first delivery          | none             | reject, requeue   |
//! | retryable error, redelivered             | error body       | reject, no requeue|
//! | non-retryable error, timeout, or panic   | error body       | reject, no requeue|
//!
//! A reply is published before the delivery is settled. A reply that fails
//! to publish is logged and the delivery is still settled: the side effect
//! already happened, and redelivery would repeat it.

use bytes::Bytes;
use switchboard_core::ReplyBody;
use tracing::{debug, warn};

use crate::broker::{Broker, Delivery, DEFAULT_EXCHANGE};
use crate::worker::DispatchError;

/// Terminal broker state for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Reject with requeue; the broker redelivers with `redelivered` set.
    Requeue,
    /// Reject without requeue; the queue's dead-letter target receives it.
    DeadLetter,
}

impl Disposition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter => "dead_letter",
        }
    }
}

/// Settlement plus the reply body to publish if the delivery is a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub disposition: Disposition,
    pub reply: Option<Bytes>,
}

impl Decision {
    /// Classifies a dispatch result.
    #[must_use]
    pub fn from_result(result: Result<Bytes, DispatchError>, redelivered: bool) -> Self {
        match result {
            Ok(payload) => Self {
                disposition: Disposition::Ack,
                reply: Some(payload),
            },
            Err(DispatchError::Handler(err)) if err.retryable && !redelivered => Self {
                disposition: Disposition::Requeue,
                reply: None,
            },
            Err(err) => Self {
                disposition: Disposition::DeadLetter,
                reply: Some(ReplyBody::error(err.to_string()).to_bytes()),
            },
        }
    }
}

/// Publishes the reply (for requests) and settles the delivery.
pub async fn settle(broker: &dyn Broker, delivery: Delivery, decision: Decision) {
    let routing_key = delivery.envelope.routing_key.as_str().to_string();

    if let Some(body) = decision.reply {
        if let Some(reply) = delivery.envelope.reply(body) {
            if let Err(err) = broker.publish(DEFAULT_EXCHANGE, reply).await {
                warn!(
                    routing_key = %routing_key,
                    error = %err,
                    "failed to publish reply; settling delivery anyway"
                );
            }
        } else if let Some(reply_to) = delivery.envelope.intent.reply_to() {
            warn!(routing_key = %routing_key, reply_to, "reply address is not routable");
        }
    }

    let disposition = decision.disposition;
    let settled = match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Requeue => delivery.reject(true).await,
        Disposition::DeadLetter => delivery.reject(false).await,
    };
    match settled {
        Ok(()) => debug!(routing_key = %routing_key, disposition = disposition.as_str(), "delivery settled"),
        Err(err) => warn!(
            routing_key = %routing_key,
            disposition = disposition.as_str(),
            error = %err,
            "failed to settle delivery"
        ),
    }
    metrics::counter!("switchboard_deliveries_total", "disposition" => disposition.as_str())
        .increment(1);
}
