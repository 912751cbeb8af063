//! Debug stepping: an opaque session handle that exposes the pending layer and
//! executes it one round at a time. The internal context never crosses the
//! boundary; callers only see effective-id strings and the final result.

use serde_json::Value;

use crate::error::{ExecutionError, ValidationError};
use crate::output::NormalizedOutput;
use crate::path::PathTracker;

use super::{ExecutionResult, Executor};

/// Result of one debug step.
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Effective ids executed by this step.
    pub executed: Vec<String>,
    /// Effective ids executable next.
    pub pending: Vec<String>,
    /// Whether the execution has reached its fixed point.
    pub done: bool,
}

/// A stepwise execution. Created by [`Executor::debug_session`]; the context is
/// retained until the session is finished or dropped.
pub struct DebugSession {
    executor: Executor,
    ctx: crate::context::ExecutionContext,
    final_output: Option<NormalizedOutput>,
    failure: Option<ExecutionError>,
    rounds: u32,
}

impl Executor {
    /// Start a stepwise execution. The starter is seeded exactly as in
    /// [`Executor::execute`]; nothing else runs until the first step.
    pub fn debug_session(
        &self,
        workflow_id: impl Into<String>,
        input: Value,
    ) -> Result<DebugSession, ValidationError> {
        self.workflow.validate()?;
        crate::observability::init_logging(&self.options.log);
        let ctx = self.build_context(workflow_id.into(), &input);
        Ok(DebugSession {
            executor: self.clone(),
            ctx,
            final_output: None,
            failure: None,
            rounds: 0,
        })
    }
}

impl DebugSession {
    /// The effective ids that would execute on the next step.
    pub fn pending(&self) -> Vec<String> {
        let tracker = PathTracker::new(self.executor.workflow());
        self.executor
            .next_layer(&self.ctx, &tracker)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Execute the next layer and fold its results.
    pub async fn step(&mut self) -> StepReport {
        self.step_inner(None).await
    }

    /// Execute only the named blocks from the next layer (ids or effective-id
    /// strings); the rest of the layer stays pending.
    pub async fn continue_with(&mut self, block_ids: &[String]) -> StepReport {
        self.step_inner(Some(block_ids)).await
    }

    async fn step_inner(&mut self, only: Option<&[String]>) -> StepReport {
        if self.failure.is_some() || self.exhausted() {
            return StepReport {
                executed: Vec::new(),
                pending: self.pending(),
                done: true,
            };
        }
        self.rounds += 1;
        match self.executor.run_round(&mut self.ctx, only).await {
            Ok(outcome) => {
                if outcome.layer_output.is_some() {
                    self.final_output = outcome.layer_output;
                }
                StepReport {
                    executed: outcome.executed.iter().map(ToString::to_string).collect(),
                    pending: self.pending(),
                    done: outcome.done,
                }
            }
            Err(err) => {
                self.failure = Some(err);
                StepReport {
                    executed: Vec::new(),
                    pending: Vec::new(),
                    done: true,
                }
            }
        }
    }

    /// Run the remaining rounds to completion and build the final result.
    pub async fn finish(mut self) -> ExecutionResult {
        let outcome = if let Some(err) = self.failure.take() {
            Err(err)
        } else if self.exhausted() {
            Err(ExecutionError::IterationLimit)
        } else {
            match self.executor.drive(&mut self.ctx).await {
                Ok(Some(output)) => Ok(Some(output)),
                Ok(None) => Ok(self.final_output.take()),
                Err(err) => Err(err),
            }
        };
        self.executor.build_result(self.ctx, outcome)
    }

    fn exhausted(&self) -> bool {
        self.rounds >= self.executor.options.max_iterations
    }
}
