//! Messaging module with deferred startup lifecycle.
//!
//! `new()` holds configuration only, `start()` connects to the broker,
//! declares the service topology, and opens the RPC client, and `serve()`
//! runs the worker pool until shutdown. Between `start()` and `serve()` the
//! rest of the process can take the client or orchestrator and register
//! handlers.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{info, warn};

use crate::broker::{self, BrokerHandle};
use crate::client::RpcClient;
use crate::config::ServiceConfig;
use crate::orchestrator::Orchestrator;
use crate::topology::TopologyManager;
use crate::worker::{HandlerRouter, WorkerPool};

/// Owns the broker connection and everything built on it for one service.
///
/// 1. `new()` / `with_broker()` -- stores configuration, connects nothing
/// 2. `start()` -- connects, ensures topology, opens the client
/// 3. `serve()` -- consumes the service queue until the shutdown future
///    resolves, then drains and closes the connection
pub struct MessagingModule {
    config: ServiceConfig,
    broker: Option<BrokerHandle>,
    client: Option<RpcClient>,
}

impl MessagingModule {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            broker: None,
            client: None,
        }
    }

    /// Uses an already connected broker; `start()` then skips connecting.
    #[must_use]
    pub fn with_broker(config: ServiceConfig, broker: BrokerHandle) -> Self {
        Self {
            config,
            broker: Some(broker),
            client: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The broker connection, once connected.
    #[must_use]
    pub fn broker(&self) -> Option<BrokerHandle> {
        self.broker.as_ref().map(Arc::clone)
    }

    /// The RPC client, after `start()`.
    #[must_use]
    pub fn client(&self) -> Option<RpcClient> {
        self.client.clone()
    }

    /// A fan-out orchestrator over the module's client, after `start()`.
    #[must_use]
    pub fn orchestrator(&self) -> Option<Orchestrator> {
        self.client.clone().map(Orchestrator::new)
    }

    /// Connects to the broker, declares the configured topology, and opens
    /// the RPC client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the broker is
    /// unreachable, or the declared topology conflicts with broker state.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.config.validate()?;

        let broker = match &self.broker {
            Some(broker) => Arc::clone(broker),
            None => {
                let broker = broker::connect(&self.config.broker)
                    .await
                    .with_context(|| format!("connecting to {}", self.config.broker.url))?;
                self.broker = Some(Arc::clone(&broker));
                broker
            }
        };

        if let Some(spec) = &self.config.topology {
            TopologyManager::new(Arc::clone(&broker)).ensure(spec).await?;
        }

        let client = RpcClient::connect(broker, self.config.client.clone()).await?;
        info!(
            exchange = %self.config.client.exchange,
            reply_queue = client.reply_queue().unwrap_or("per-call"),
            "messaging module started"
        );
        self.client = Some(client);
        Ok(())
    }

    /// Consumes the service queue with `router` until `shutdown` resolves or
    /// every worker exits, then drains in-flight deliveries and closes the
    /// broker connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, no queue is configured,
    /// or the pool cannot attach its consumer.
    pub async fn serve(
        self,
        router: HandlerRouter,
        shutdown: impl Future<Output = ()> + Send,
    ) -> anyhow::Result<()> {
        let Some(broker) = self.broker else {
            anyhow::bail!("start() must be called before serve()");
        };
        if self.client.is_none() {
            anyhow::bail!("start() must be called before serve()");
        }
        let queue = self
            .config
            .pool_queue()
            .context("no queue to consume: set pool.queue or topology.queue")?;

        let mut pool = WorkerPool::start(Arc::clone(&broker), queue, &self.config.pool, router)
            .await
            .with_context(|| format!("starting worker pool on {queue}"))?;

        tokio::select! {
            () = shutdown => info!(queue = %queue, "shutdown requested"),
            () = pool.wait_exited() => warn!(queue = %queue, "all workers exited"),
        }

        let drained = pool.shutdown(self.config.pool.drain_timeout()).await;
        if !drained {
            warn!(queue = %queue, "drain timeout expired with in-flight deliveries remaining");
        }
        drop(self.client);
        broker.close().await?;
        info!(queue = %queue, "messaging module stopped");
        Ok(())
    }

    /// Closes the broker connection without serving.
    ///
    /// # Errors
    ///
    /// Returns the broker's close error.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        drop(self.client);
        if let Some(broker) = self.broker {
            broker.close().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use switchboard_core::{
        ExchangeDecl, ExchangeKind, ExchangeSpec, RoutingKey, Step, TopologySpec,
    };
    use tokio::sync::oneshot;

    use super::*;
    use crate::broker::{Broker, BrokerError, InMemoryBroker};
    use crate::topology::TopologyError;
    use crate::worker::HandlerError;

    fn key(s: &str) -> RoutingKey {
        RoutingKey::new(s).unwrap()
    }

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig::default();
        config.broker.url = "memory://test".to_string();
        config.client.exchange = "clearSky.events".to_string();
        config.topology = Some(TopologySpec {
            exchange: ExchangeSpec {
                name: "clearSky.events".to_string(),
                kind: ExchangeKind::Topic,
            },
            queue: "credits_service_queue".to_string(),
            dead_letter: None,
            bindings: vec![key("credits.*")],
        });
        config
    }

    #[test]
    fn new_connects_nothing() {
        let module = MessagingModule::new(config());
        assert!(module.broker().is_none());
        assert!(module.client().is_none());
        assert!(module.orchestrator().is_none());
    }

    #[tokio::test]
    async fn start_connects_and_declares_topology() {
        let broker = InMemoryBroker::new();
        let mut module = MessagingModule::with_broker(config(), Arc::new(broker.clone()));
        module.start().await.unwrap();
        assert!(module.client().is_some());
        let snapshot = broker.snapshot();
        assert!(snapshot.queues.contains_key("credits_service_queue"));
        assert!(snapshot.exchanges.contains_key("clearSky.events"));
    }

    #[tokio::test]
    async fn start_with_memory_url_connects() {
        let mut module = MessagingModule::new(config());
        module.start().await.unwrap();
        let b1 = module.broker().unwrap();
        let b2 = module.broker().unwrap();
        assert!(Arc::ptr_eq(&b1, &b2));
        module.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn topology_conflict_fails_start() {
        let broker = InMemoryBroker::new();
        broker
            .declare_exchange(&ExchangeDecl::durable("clearSky.events", ExchangeKind::Direct))
            .await
            .unwrap();
        let mut module = MessagingModule::with_broker(config(), Arc::new(broker));
        let err = module.start().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TopologyError>(),
            Some(TopologyError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = MessagingModule::new(config());
        let err = module
            .serve(HandlerRouter::new(), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serves_calls_until_shutdown() {
        let broker = InMemoryBroker::new();
        let mut module = MessagingModule::with_broker(config(), Arc::new(broker.clone()));
        module.start().await.unwrap();
        let orchestrator = module.orchestrator().unwrap();
        let client = module.client().unwrap();

        let mut router = HandlerRouter::new();
        router.register_json(key("credits.spent"), |req: serde_json::Value| async move {
            Ok::<_, HandlerError>(serde_json::json!({ "echo": req }))
        });
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(router, async move {
            let _ = stop_rx.await;
        }));

        let reply = client
            .call(
                &key("credits.spent"),
                Bytes::from_static(br#"{"n":1}"#),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let body = switchboard_core::ReplyBody::from_slice(&reply).unwrap();
        assert_eq!(body.data.unwrap()["echo"]["n"], 1);

        let result = orchestrator
            .aggregate(vec![Step::call(key("credits.spent"), Bytes::from_static(b"{}"))])
            .await
            .unwrap();
        assert!(result.is_success());

        stop_tx.send(()).unwrap();
        server.await.unwrap().unwrap();

        let err = client
            .call(&key("credits.spent"), Bytes::new(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::client::CallError::ConnectionLost
                | crate::client::CallError::Transport(BrokerError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn serve_requires_a_queue() {
        let mut config = config();
        config.topology = None;
        let mut module = MessagingModule::with_broker(config, Arc::new(InMemoryBroker::new()));
        module.start().await.unwrap();
        let err = module
            .serve(HandlerRouter::new(), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no queue"));
    }
}
