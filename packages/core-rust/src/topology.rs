//! Broker topology declarations.
//!
//! [`ExchangeDecl`] and [`QueueDecl`] describe single broker objects and are
//! compared field by field to detect conflicting redeclarations.
//! [`TopologySpec`] describes a whole service: its exchange, its durable queue,
//! the dead-letter pair, and the routing keys the service claims.

use serde::{Deserialize, Serialize};

use crate::routing::{ExchangeKind, RoutingKey};

// ---------------------------------------------------------------------------
// Object declarations
// ---------------------------------------------------------------------------

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDecl {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeDecl {
    /// Durable, non-auto-deleting exchange.
    #[must_use]
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            auto_delete: false,
        }
    }
}

/// Where a queue sends deliveries rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// Queue declaration. An empty `name` asks the broker to generate one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDecl {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueDecl {
    /// Durable, shared work queue.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter: None,
        }
    }

    /// Server-named, exclusive, auto-deleting queue used to receive replies.
    #[must_use]
    pub fn reply() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            dead_letter: None,
        }
    }

    #[must_use]
    pub fn with_dead_letter(mut self, target: DeadLetterTarget) -> Self {
        self.dead_letter = Some(target);
        self
    }

    #[must_use]
    pub fn is_server_named(&self) -> bool {
        self.name.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TopologySpec
// ---------------------------------------------------------------------------

/// Exchange section of a [`TopologySpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(default = "default_exchange_kind")]
    pub kind: ExchangeKind,
}

fn default_exchange_kind() -> ExchangeKind {
    ExchangeKind::Topic
}

/// Dead-letter exchange/queue pair receiving permanently rejected deliveries.
///
/// `exchange` may equal the service exchange; it is then not redeclared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Full routing surface of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub exchange: ExchangeSpec,
    /// Durable per-service queue name.
    pub queue: String,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterSpec>,
    /// Routing keys (or topic patterns) this service claims.
    #[serde(default)]
    pub bindings: Vec<RoutingKey>,
}

impl TopologySpec {
    /// The service exchange declaration.
    #[must_use]
    pub fn exchange_decl(&self) -> ExchangeDecl {
        ExchangeDecl::durable(self.exchange.name.clone(), self.exchange.kind)
    }

    /// The service queue declaration, with dead-letter arguments if configured.
    #[must_use]
    pub fn queue_decl(&self) -> QueueDecl {
        let decl = QueueDecl::durable(self.queue.clone());
        match &self.dead_letter {
            Some(dl) => decl.with_dead_letter(DeadLetterTarget {
                exchange: dl.exchange.clone(),
                routing_key: dl.routing_key.clone(),
            }),
            None => decl,
        }
    }

    /// The dead-letter exchange declaration, unless it is the service
    /// exchange itself.
    #[must_use]
    pub fn dead_letter_exchange_decl(&self) -> Option<ExchangeDecl> {
        self.dead_letter
            .as_ref()
            .filter(|dl| dl.exchange != self.exchange.name)
            .map(|dl| ExchangeDecl::durable(dl.exchange.clone(), ExchangeKind::Direct))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dl_exchange: &str) -> TopologySpec {
        TopologySpec {
            exchange: ExchangeSpec {
                name: "clearSky.events".to_string(),
                kind: ExchangeKind::Topic,
            },
            queue: "stats_service_rpc_queue".to_string(),
            dead_letter: Some(DeadLetterSpec {
                exchange: dl_exchange.to_string(),
                queue: "stats_service_dlq".to_string(),
                routing_key: "stats.dead".to_string(),
            }),
            bindings: vec![RoutingKey::new("stats.persist_and_calculate").unwrap()],
        }
    }

    #[test]
    fn queue_decl_carries_dead_letter_target() {
        let decl = spec("clearSky.dlx").queue_decl();
        assert!(decl.durable);
        assert_eq!(
            decl.dead_letter,
            Some(DeadLetterTarget {
                exchange: "clearSky.dlx".to_string(),
                routing_key: "stats.dead".to_string(),
            })
        );
    }

    #[test]
    fn shared_dead_letter_exchange_is_not_redeclared() {
        assert!(spec("clearSky.events").dead_letter_exchange_decl().is_none());
        let dlx = spec("clearSky.dlx").dead_letter_exchange_decl().unwrap();
        assert_eq!(dlx.kind, ExchangeKind::Direct);
    }

    #[test]
    fn reply_queue_is_server_named_and_exclusive() {
        let decl = QueueDecl::reply();
        assert!(decl.is_server_named());
        assert!(decl.exclusive && decl.auto_delete && !decl.durable);
    }

    #[test]
    fn exchange_kind_defaults_to_topic() {
        let exchange: ExchangeSpec = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert_eq!(exchange.kind, ExchangeKind::Topic);
    }
}
