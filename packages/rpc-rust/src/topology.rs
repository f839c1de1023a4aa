//! Topology manager: declares a service's exchange, queue, dead-letter pair,
//! and bindings.

use switchboard_core::{QueueDecl, TopologySpec};
use tracing::{debug, info};

use crate::broker::{BrokerError, BrokerHandle};

/// Failure to establish a topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The broker already holds a differently configured object. Fatal;
    /// retrying cannot succeed without an operator changing one side.
    #[error("topology conflict: {0}")]
    Conflict(#[source] BrokerError),
    #[error("topology declaration failed: {0}")]
    Broker(#[source] BrokerError),
}

impl From<BrokerError> for TopologyError {
    fn from(err: BrokerError) -> Self {
        if err.is_conflict() {
            TopologyError::Conflict(err)
        } else {
            TopologyError::Broker(err)
        }
    }
}

/// Declares topologies on one broker connection.
#[derive(Clone)]
pub struct TopologyManager {
    broker: BrokerHandle,
}

impl TopologyManager {
    #[must_use]
    pub fn new(broker: BrokerHandle) -> Self {
        Self { broker }
    }

    /// Declares everything `spec` describes. Safe to call repeatedly with the
    /// same spec: identical declarations and bindings are no-ops.
    ///
    /// Order: service exchange, dead-letter exchange and queue, service queue
    /// (whose arguments reference the dead-letter exchange), bindings.
    ///
    /// # Errors
    ///
    /// Returns `TopologyError::Conflict` if any object exists with different
    /// attributes, `TopologyError::Broker` for every other broker failure.
    pub async fn ensure(&self, spec: &TopologySpec) -> Result<(), TopologyError> {
        let exchange = spec.exchange_decl();
        self.broker.declare_exchange(&exchange).await?;
        debug!(exchange = %exchange.name, kind = exchange.kind.as_str(), "exchange declared");

        if let Some(dead_letter) = &spec.dead_letter {
            if let Some(dlx) = spec.dead_letter_exchange_decl() {
                self.broker.declare_exchange(&dlx).await?;
            }
            let dlq = self
                .broker
                .declare_queue(&QueueDecl::durable(dead_letter.queue.clone()))
                .await?;
            self.broker
                .bind_queue(&dlq, &dead_letter.exchange, &dead_letter.routing_key)
                .await?;
            debug!(queue = %dlq, exchange = %dead_letter.exchange, "dead-letter queue declared");
        }

        let queue = self.broker.declare_queue(&spec.queue_decl()).await?;
        for key in &spec.bindings {
            self.broker
                .bind_queue(&queue, &exchange.name, key.as_str())
                .await?;
        }

        info!(
            exchange = %exchange.name,
            queue = %queue,
            bindings = spec.bindings.len(),
            "topology ensured"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use futures_util::StreamExt;
    use switchboard_core::{
        DeadLetterSpec, Envelope, ExchangeDecl, ExchangeKind, ExchangeSpec, RoutingKey,
    };

    use super::*;
    use crate::broker::{Broker, ConsumeOptions, InMemoryBroker};

    fn spec() -> TopologySpec {
        TopologySpec {
            exchange: ExchangeSpec {
                name: "clearSky.events".to_string(),
                kind: ExchangeKind::Topic,
            },
            queue: "postgrades_service_queue".to_string(),
            dead_letter: Some(DeadLetterSpec {
                exchange: "clearSky.dlx".to_string(),
                queue: "postgrades_service_dlq".to_string(),
                routing_key: "postgrades.dead".to_string(),
            }),
            bindings: vec![
                RoutingKey::new("postgrades.init").unwrap(),
                RoutingKey::new("postgrades.final").unwrap(),
            ],
        }
    }

    #[tokio::test]
    async fn ensure_twice_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = TopologyManager::new(Arc::new(broker.clone()));

        manager.ensure(&spec()).await.unwrap();
        let first = broker.snapshot();
        manager.ensure(&spec()).await.unwrap();
        let second = broker.snapshot();

        assert_eq!(first, second);
        assert_eq!(first.exchanges.len(), 2);
        assert_eq!(first.queues.len(), 2);
        assert_eq!(first.bindings.len(), 3);
    }

    #[tokio::test]
    async fn conflicting_exchange_is_configuration_error() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDecl::durable("clearSky.events", ExchangeKind::Direct))
            .await
            .unwrap();
        let manager = TopologyManager::new(Arc::new(broker));

        let err = manager.ensure(&spec()).await.unwrap_err();
        assert!(matches!(err, TopologyError::Conflict(_)));
    }

    #[tokio::test]
    async fn queue_without_dead_letter_conflicts_with_one() {
        let broker = InMemoryBroker::new();
        let manager = TopologyManager::new(Arc::new(broker));
        let mut plain = spec();
        plain.dead_letter = None;
        manager.ensure(&plain).await.unwrap();

        let err = manager.ensure(&spec()).await.unwrap_err();
        assert!(matches!(err, TopologyError::Conflict(_)));
    }

    #[tokio::test]
    async fn closed_connection_is_broker_error() {
        let broker = InMemoryBroker::new();
        broker.disconnect();
        let manager = TopologyManager::new(Arc::new(broker));
        let err = manager.ensure(&spec()).await.unwrap_err();
        assert!(matches!(
            err,
            TopologyError::Broker(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn bound_keys_reach_the_service_queue() {
        let broker = InMemoryBroker::new();
        let manager = TopologyManager::new(Arc::new(broker.clone()));
        manager.ensure(&spec()).await.unwrap();

        let mut stream = broker
            .consume("postgrades_service_queue", ConsumeOptions::work_queue(1, "t"))
            .await
            .unwrap();
        broker
            .publish(
                "clearSky.events",
                Envelope::notify(
                    RoutingKey::new("postgrades.final").unwrap(),
                    Bytes::from_static(b"{}"),
                ),
            )
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.routing_key.as_str(), "postgrades.final");
    }
}
