//! The unit of transport between callers and workers.
//!
//! An [`Envelope`] carries a routing key, an opaque body, and an [`Intent`]
//! that states whether the sender expects a reply. The correlation id is the
//! only linkage between a request and its reply.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::correlation::CorrelationId;
use crate::routing::RoutingKey;

/// Content type used when none is given.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// What the sender expects from the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Fire-and-forget: no reply is published.
    Notify,
    /// Synchronous call emulation: the worker publishes a reply to `reply_to`
    /// carrying the same `correlation_id`.
    Request {
        correlation_id: CorrelationId,
        reply_to: String,
    },
    /// Answer to an earlier request.
    Reply { correlation_id: CorrelationId },
}

impl Intent {
    #[must_use]
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            Intent::Notify => None,
            Intent::Request { correlation_id, .. } | Intent::Reply { correlation_id } => {
                Some(correlation_id)
            }
        }
    }

    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        match self {
            Intent::Request { reply_to, .. } => Some(reply_to),
            Intent::Notify | Intent::Reply { .. } => None,
        }
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::Notify => "notify",
            Intent::Request { .. } => "request",
            Intent::Reply { .. } => "reply",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A message as seen by the messaging core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub routing_key: RoutingKey,
    pub intent: Intent,
    pub content_type: String,
    pub body: Bytes,
    /// Ask the broker to keep the message across restarts.
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Unix time in milliseconds.
    pub timestamp: Option<u64>,
}

impl Envelope {
    fn new(routing_key: RoutingKey, intent: Intent, body: Bytes) -> Self {
        Self {
            routing_key,
            intent,
            content_type: JSON_CONTENT_TYPE.to_string(),
            body,
            persistent: false,
            message_id: None,
            timestamp: Some(now_millis()),
        }
    }

    /// Fire-and-forget message.
    #[must_use]
    pub fn notify(routing_key: RoutingKey, body: Bytes) -> Self {
        Self::new(routing_key, Intent::Notify, body)
    }

    /// Request expecting a reply on `reply_to`.
    #[must_use]
    pub fn request(
        routing_key: RoutingKey,
        body: Bytes,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        Self::new(
            routing_key,
            Intent::Request {
                correlation_id,
                reply_to: reply_to.into(),
            },
            body,
        )
    }

    /// Reply to a request. The reply is addressed by the request's reply
    /// queue name and carries the request's correlation id unchanged.
    ///
    /// Returns `None` if `self` is not a request, or if its reply address is
    /// not usable as a routing key.
    #[must_use]
    pub fn reply(&self, body: Bytes) -> Option<Self> {
        let Intent::Request {
            correlation_id,
            reply_to,
        } = &self.intent
        else {
            return None;
        };
        let routing_key = RoutingKey::new(reply_to.clone()).ok()?;
        Some(Self::new(
            routing_key,
            Intent::Reply {
                correlation_id: correlation_id.clone(),
            },
            body,
        ))
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    #[must_use]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.intent.correlation_id()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> RoutingKey {
        RoutingKey::new(s).unwrap()
    }

    #[test]
    fn notify_has_no_reply_address() {
        let env = Envelope::notify(key("credits.spent"), Bytes::from_static(b"{}"));
        assert_eq!(env.intent, Intent::Notify);
        assert!(env.correlation_id().is_none());
        assert!(env.intent.reply_to().is_none());
        assert_eq!(env.content_type, JSON_CONTENT_TYPE);
    }

    #[test]
    fn reply_keeps_correlation_id_and_targets_reply_queue() {
        let id = CorrelationId::generate();
        let req = Envelope::request(
            key("stats.get_distributions"),
            Bytes::from_static(b"{}"),
            id.clone(),
            "amq.gen-abc",
        );
        let reply = req.reply(Bytes::from_static(b"{\"status\":\"ok\"}")).unwrap();
        assert_eq!(reply.routing_key.as_str(), "amq.gen-abc");
        assert_eq!(reply.intent, Intent::Reply { correlation_id: id });
    }

    #[test]
    fn cannot_reply_to_notify_or_reply() {
        let notify = Envelope::notify(key("a.b"), Bytes::new());
        assert!(notify.reply(Bytes::new()).is_none());

        let reply = Envelope {
            intent: Intent::Reply {
                correlation_id: CorrelationId::generate(),
            },
            ..notify
        };
        assert!(reply.reply(Bytes::new()).is_none());
    }

    #[test]
    fn builders_set_metadata() {
        let env = Envelope::notify(key("postgrades.init"), Bytes::new())
            .with_content_type("text/plain")
            .with_persistent(true)
            .with_message_id("grades.xlsx");
        assert_eq!(env.content_type, "text/plain");
        assert!(env.persistent);
        assert_eq!(env.message_id.as_deref(), Some("grades.xlsx"));
    }
}
