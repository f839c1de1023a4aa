//! Switchboard Core — routing keys, envelopes, wire codec, topology declarations,
//! and fan-out result types for request/reply messaging over a pub/sub broker.

pub mod aggregate;
pub mod correlation;
pub mod envelope;
pub mod reply;
pub mod routing;
pub mod topology;
pub mod wire;

pub use aggregate::{
    validate_plan, AggregateResult, AggregateStatus, PlanError, Step, StepError, StepMode,
    StepOutcome, StepReport,
};
pub use correlation::CorrelationId;
pub use envelope::{Envelope, Intent, JSON_CONTENT_TYPE};
pub use reply::{ReplyBody, ReplyStatus};
pub use routing::{topic_matches, ExchangeKind, RoutingKey, RoutingKeyError};
pub use topology::{
    DeadLetterSpec, DeadLetterTarget, ExchangeDecl, ExchangeSpec, QueueDecl, TopologySpec,
};
pub use wire::WireError;
