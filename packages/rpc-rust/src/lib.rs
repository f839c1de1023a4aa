//! Switchboard RPC — broker topology, request/reply client, worker pool, and
//! fan-out orchestration over a message broker.
//!
//! - [`broker`]: the [`Broker`](broker::Broker) trait, an in-memory broker,
//!   and AMQP via `lapin` (feature `amqp`)
//! - [`topology`]: idempotent declaration of a service's routing surface
//! - [`client`]: correlated calls with timeouts over reply queues
//! - [`worker`]: prefetch-bounded handler pool with reply/ack dispositions
//! - [`orchestrator`]: concurrent fan-out with per-step outcomes
//! - [`module`]: startup and shutdown lifecycle tying the pieces together

pub mod broker;
pub mod client;
pub mod config;
pub mod logging;
pub mod module;
pub mod orchestrator;
pub mod topology;
pub mod worker;

pub use broker::{Broker, BrokerError, BrokerHandle, InMemoryBroker};
pub use client::{CallError, RpcClient};
pub use config::{ConfigError, ServiceConfig};
pub use module::MessagingModule;
pub use orchestrator::Orchestrator;
pub use topology::{TopologyError, TopologyManager};
pub use worker::{HandlerError, HandlerRouter, WorkerPool};
