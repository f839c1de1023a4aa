//! Fan-out plan and result types.
//!
//! One client-facing operation is decomposed into ordered [`Step`]s. Each
//! step resolves to a [`StepOutcome`]; the overall [`AggregateStatus`] is
//! derived from the outcomes and never assumed. Partial success is a valid
//! terminal state.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::routing::RoutingKey;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// How a step talks to its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    /// Request/reply call; the step succeeds when a non-error reply arrives.
    Call,
    /// Fire-and-forget event; the step succeeds once the broker accepts it.
    Notify,
}

/// One call of a fan-out plan.
#[derive(Debug, Clone)]
pub struct Step {
    pub routing_key: RoutingKey,
    pub payload: Bytes,
    pub mode: StepMode,
    /// Per-step timeout; the orchestrator default applies when `None`.
    pub timeout: Option<Duration>,
    /// Indices of earlier steps that must have succeeded before this one runs.
    pub requires: Vec<usize>,
}

impl Step {
    #[must_use]
    pub fn call(routing_key: RoutingKey, payload: impl Into<Bytes>) -> Self {
        Self {
            routing_key,
            payload: payload.into(),
            mode: StepMode::Call,
            timeout: None,
            requires: Vec::new(),
        }
    }

    #[must_use]
    pub fn notify(routing_key: RoutingKey, payload: impl Into<Bytes>) -> Self {
        Self {
            mode: StepMode::Notify,
            ..Self::call(routing_key, payload)
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Runs this step only if step `index` succeeded.
    #[must_use]
    pub fn after(mut self, index: usize) -> Self {
        self.requires.push(index);
        self
    }
}

/// A plan whose dependencies cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("step {step} requires step {requires}, which does not run before it")]
    ForwardDependency { step: usize, requires: usize },
}

/// Checks that every dependency points at an earlier step, which also rules
/// out cycles.
///
/// # Errors
///
/// Returns `PlanError::ForwardDependency` for the first offending step.
pub fn validate_plan(steps: &[Step]) -> Result<(), PlanError> {
    for (index, step) in steps.iter().enumerate() {
        if let Some(&requires) = step.requires.iter().find(|&&r| r >= index) {
            return Err(PlanError::ForwardDependency {
                step: index,
                requires,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Why a step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// No reply within the deadline. The outcome is unknown, not failed.
    #[error("no reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("transport failure: {message}")]
    Transport { message: String },
    /// The service replied with an error status.
    #[error("handler error: {message}")]
    Handler { message: String },
}

/// Terminal state of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Succeeded { response: Bytes },
    Failed { error: StepError },
    /// Not executed because a required step did not succeed.
    Skipped { blocked_by: usize },
}

impl StepOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded { .. })
    }
}

/// Derived status of a fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AggregateStatus {
    Success,
    /// At least one step succeeded and at least one did not.
    Partial {
        failed: Vec<usize>,
        skipped: Vec<usize>,
    },
    Failed,
}

/// Per-step report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub routing_key: RoutingKey,
    pub outcome: StepOutcome,
}

/// Result of a fan-out, in plan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateResult {
    pub steps: Vec<StepReport>,
    pub status: AggregateStatus,
}

impl AggregateResult {
    /// Builds a result and derives its status from the outcomes.
    #[must_use]
    pub fn from_reports(steps: Vec<StepReport>) -> Self {
        let status = derive_status(&steps);
        Self { steps, status }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == AggregateStatus::Success
    }

    /// `(index, error)` for every failed step.
    #[must_use]
    pub fn failures(&self) -> Vec<(usize, &StepError)> {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(i, r)| match &r.outcome {
                StepOutcome::Failed { error } => Some((i, error)),
                _ => None,
            })
            .collect()
    }
}

fn derive_status(steps: &[StepReport]) -> AggregateStatus {
    let succeeded = steps.iter().filter(|r| r.outcome.is_success()).count();
    if succeeded == steps.len() {
        return AggregateStatus::Success;
    }
    if succeeded == 0 {
        return AggregateStatus::Failed;
    }
    let mut failed = Vec::new();
    let mut skipped = Vec::new();
    for (i, report) in steps.iter().enumerate() {
        match report.outcome {
            StepOutcome::Failed { .. } => failed.push(i),
            StepOutcome::Skipped { .. } => skipped.push(i),
            StepOutcome::Succeeded { .. } => {}
        }
    }
    AggregateStatus::Partial { failed, skipped }
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

    fn report(outcome: StepOutcome) -> StepReport {
        StepReport {
            routing_key: key("svc.op"),
            outcome,
        }
    }

    fn ok() -> StepOutcome {
        StepOutcome::Succeeded {
            response: Bytes::from_static(b"{}"),
        }
    }

    fn failed() -> StepOutcome {
        StepOutcome::Failed {
            error: StepError::Handler {
                message: "boom".to_string(),
            },
        }
    }

    #[test]
    fn all_succeeded_is_success() {
        let result = AggregateResult::from_reports(vec![report(ok()), report(ok())]);
        assert_eq!(result.status, AggregateStatus::Success);
    }

    #[test]
    fn mixed_is_partial_and_enumerates_failures() {
        let result = AggregateResult::from_reports(vec![
            report(ok()),
            report(failed()),
            report(StepOutcome::Skipped { blocked_by: 1 }),
            report(ok()),
        ]);
        assert_eq!(
            result.status,
            AggregateStatus::Partial {
                failed: vec![1],
                skipped: vec![2],
            }
        );
        assert!(!result.is_success());
        assert_eq!(result.failures().len(), 1);
    }

    #[test]
    fn nothing_succeeded_is_failed() {
        let result = AggregateResult::from_reports(vec![
            report(failed()),
            report(StepOutcome::Skipped { blocked_by: 0 }),
        ]);
        assert_eq!(result.status, AggregateStatus::Failed);
    }

    #[test]
    fn empty_plan_is_success() {
        assert!(AggregateResult::from_reports(Vec::new()).is_success());
    }

    #[test]
    fn forward_dependencies_are_rejected() {
        let steps = vec![
            Step::call(key("a.b"), Bytes::new()).after(1),
            Step::call(key("c.d"), Bytes::new()),
        ];
        assert_eq!(
            validate_plan(&steps),
            Err(PlanError::ForwardDependency {
                step: 0,
                requires: 1
            })
        );

        let self_dep = vec![Step::call(key("a.b"), Bytes::new()).after(0)];
        assert!(validate_plan(&self_dep).is_err());
    }

    #[test]
    fn backward_dependencies_are_accepted() {
        let steps = vec![
            Step::call(key("postgrades.final"), Bytes::new()),
            Step::notify(key("credits.spent"), Bytes::new()).after(0),
        ];
        assert!(validate_plan(&steps).is_ok());
        assert_eq!(steps[1].mode, StepMode::Notify);
    }

    #[test]
    fn status_serializes_with_tag() {
        let json = serde_json::to_value(AggregateStatus::Partial {
            failed: vec![1],
            skipped: vec![],
        })
        .unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["failed"][0], 1);
    }
}
