//! Fan-out orchestrator: runs a plan of calls and aggregates the outcomes.
//!
//! Steps run in waves: every step whose dependencies are resolved runs
//! concurrently with the others in its wave, so an independent plan costs
//! the latency of its slowest step. A failed step never stops the plan; only
//! steps that declared a dependency on it are skipped. The aggregate is
//! returned after every step has resolved.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use switchboard_core::{
    validate_plan, AggregateResult, PlanError, ReplyBody, Step, StepError, StepMode, StepOutcome,
    StepReport,
};
use tracing::{debug, info, info_span, Instrument};

use crate::client::{CallError, RpcClient};

impl From<CallError> for StepError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Timeout { timeout_ms } => StepError::Timeout { timeout_ms },
            other => StepError::Transport {
                message: other.to_string(),
            },
        }
    }
}

/// Runs fan-out plans over an [`RpcClient`].
#[derive(Clone)]
pub struct Orchestrator {
    client: RpcClient,
    default_timeout: Duration,
}

impl Orchestrator {
    /// Uses the client's default timeout for steps without their own.
    #[must_use]
    pub fn new(client: RpcClient) -> Self {
        let default_timeout = client.default_timeout();
        Self {
            client,
            default_timeout,
        }
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Executes `steps` and reports every outcome in plan order.
    ///
    /// # Errors
    ///
    /// Returns `PlanError` if a step depends on itself or a later step.
    /// Step failures are never errors here; they are reported in the result.
    pub async fn aggregate(&self, steps: Vec<Step>) -> Result<AggregateResult, PlanError> {
        validate_plan(&steps)?;
        let span = info_span!("aggregate", steps = steps.len());
        let result = self.run_plan(steps).instrument(span).await;
        info!(status = ?result.status, steps = result.steps.len(), "aggregate complete");
        Ok(result)
    }

    async fn run_plan(&self, steps: Vec<Step>) -> AggregateResult {
        let mut outcomes: Vec<Option<StepOutcome>> = vec![None; steps.len()];
        let mut wave = 0_usize;

        while outcomes.iter().any(Option::is_none) {
            let mut runnable = Vec::new();
            for (index, step) in steps.iter().enumerate() {
                if outcomes[index].is_some()
                    || step.requires.iter().any(|&r| outcomes[r].is_none())
                {
                    continue;
                }
                let blocked_by = step
                    .requires
                    .iter()
                    .copied()
                    .find(|&r| !outcomes[r].as_ref().is_some_and(StepOutcome::is_success));
                match blocked_by {
                    Some(blocked_by) => {
                        debug!(step = index, blocked_by, "step skipped");
                        outcomes[index] = Some(StepOutcome::Skipped { blocked_by });
                    }
                    None => runnable.push(index),
                }
            }
            if runnable.is_empty() {
                continue;
            }

            wave += 1;
            debug!(wave, steps = ?runnable, "running wave");
            let results = join_all(runnable.iter().map(|&i| self.run_step(i, &steps[i]))).await;
            for (index, outcome) in runnable.into_iter().zip(results) {
                outcomes[index] = Some(outcome);
            }
        }

        let reports = steps
            .into_iter()
            .zip(outcomes.into_iter().flatten())
            .map(|(step, outcome)| StepReport {
                routing_key: step.routing_key,
                outcome,
            })
            .collect();
        AggregateResult::from_reports(reports)
    }

    async fn run_step(&self, index: usize, step: &Step) -> StepOutcome {
        let outcome = match step.mode {
            StepMode::Call => {
                let timeout = step.timeout.unwrap_or(self.default_timeout);
                match self
                    .client
                    .call(&step.routing_key, step.payload.clone(), timeout)
                    .await
                {
                    Ok(response) => classify_reply(response),
                    Err(err) => StepOutcome::Failed { error: err.into() },
                }
            }
            StepMode::Notify => match self
                .client
                .notify(&step.routing_key, step.payload.clone())
                .await
            {
                Ok(()) => StepOutcome::Succeeded {
                    response: Bytes::new(),
                },
                Err(err) => StepOutcome::Failed { error: err.into() },
            },
        };
        debug!(
            step = index,
            routing_key = %step.routing_key,
            success = outcome.is_success(),
            "step resolved"
        );
        outcome
    }
}

/// A reply whose body is a `ReplyBody` with error status is a handler
/// failure; any other reply is the step's response.
fn classify_reply(response: Bytes) -> StepOutcome {
    match ReplyBody::from_slice(&response) {
        Ok(body) if !body.is_ok() => StepOutcome::Failed {
            error: StepError::Handler {
                message: body.failure_text().unwrap_or("unspecified error").to_string(),
            },
        },
        _ => StepOutcome::Succeeded { response },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
