//! Envelope wire format.
//!
//! The wire shape is flat: `{routingKey, correlationId?, replyTo?,
//! contentType, body, persistent, messageId?, timestamp?}`, encoded as named
//! `MsgPack` via `rmp_serde::to_vec_named()`. The body stays opaque bytes so it
//! can be decoded independently of the envelope.
//!
//! Transports that carry message properties natively (AMQP) map the same
//! fields onto their own headers and do not need this codec.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::envelope::{Envelope, Intent};
use crate::routing::{RoutingKey, RoutingKeyError};

/// Errors from encoding or decoding an envelope frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("invalid routing key in frame: {0}")]
    RoutingKey(#[from] RoutingKeyError),
    #[error("frame has replyTo but no correlationId")]
    ReplyToWithoutCorrelation,
}

/// Flat on-the-wire representation. The reply direction is inferred: a frame
/// with a correlation id and no reply address is a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    routing_key: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    reply_to: Option<String>,
    content_type: String,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
    #[serde(default)]
    persistent: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    timestamp: Option<u64>,
}

impl From<&Envelope> for WireEnvelope {
    fn from(env: &Envelope) -> Self {
        let (correlation_id, reply_to) = match &env.intent {
            Intent::Notify => (None, None),
            Intent::Request {
                correlation_id,
                reply_to,
            } => (Some(correlation_id.to_string()), Some(reply_to.clone())),
            Intent::Reply { correlation_id } => (Some(correlation_id.to_string()), None),
        };
        Self {
            routing_key: env.routing_key.to_string(),
            correlation_id,
            reply_to,
            content_type: env.content_type.clone(),
            body: env.body.to_vec(),
            persistent: env.persistent,
            message_id: env.message_id.clone(),
            timestamp: env.timestamp,
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = WireError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let intent = intent_from_parts(wire.correlation_id, wire.reply_to)?;
        Ok(Envelope {
            routing_key: RoutingKey::new(wire.routing_key)?,
            intent,
            content_type: wire.content_type,
            body: Bytes::from(wire.body),
            persistent: wire.persistent,
            message_id: wire.message_id,
            timestamp: wire.timestamp,
        })
    }
}

/// Rebuilds an [`Intent`] from the two optional header fields every
/// transport carries. Empty strings count as absent.
///
/// # Errors
///
/// Returns `WireError::ReplyToWithoutCorrelation` when a reply address is set
/// without a correlation id: such a request could never be matched.
pub fn intent_from_parts(
    correlation_id: Option<String>,
    reply_to: Option<String>,
) -> Result<Intent, WireError> {
    let correlation_id = correlation_id.filter(|c| !c.is_empty());
    let reply_to = reply_to.filter(|r| !r.is_empty());
    match (correlation_id, reply_to) {
        (None, None) => Ok(Intent::Notify),
        (None, Some(_)) => Err(WireError::ReplyToWithoutCorrelation),
        (Some(id), None) => Ok(Intent::Reply {
            correlation_id: CorrelationId::from(id),
        }),
        (Some(id), Some(reply_to)) => Ok(Intent::Request {
            correlation_id: CorrelationId::from(id),
            reply_to,
        }),
    }
}

/// Encodes an envelope into a frame.
///
/// # Errors
///
/// Returns `WireError::Encode` if serialization fails.
pub fn encode(env: &Envelope) -> Result<Vec<u8>, WireError> {
    Ok(rmp_serde::to_vec_named(&WireEnvelope::from(env))?)
}

/// Decodes a frame produced by [`encode`].
///
/// # Errors
///
/// Returns `WireError` if the bytes are not a valid frame.
pub fn decode(bytes: &[u8]) -> Result<Envelope, WireError> {
    let wire: WireEnvelope = rmp_serde::from_slice(bytes)?;
    Envelope::try_from(wire)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
