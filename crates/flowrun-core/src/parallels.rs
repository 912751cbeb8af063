//! Parallel management: fan-out materialisation when a parallel block
//! executes, virtual-instance candidates for the scheduler, and the post-layer
//! pass that latches completion and publishes the aggregate.

use tracing::debug;

use crate::context::{EffectiveId, ExecutionContext, ParallelExecution};
use crate::error::ExecutionError;
use crate::output::{AggregateOutput, FlowControlOutput, NormalizedOutput};
use crate::workflow::{Block, Handle, ParallelConfig, Workflow};

pub struct ParallelManager<'w> {
    workflow: &'w Workflow,
}

impl<'w> ParallelManager<'w> {
    pub fn new(workflow: &'w Workflow) -> Self {
        Self { workflow }
    }

    /// Execute a parallel block: materialise the fan-out state and activate the
    /// parallel-start edges. From here on the construct's children run under
    /// virtual ids only; iterations never reset.
    pub fn execute_parallel_block(
        &self,
        block: &Block,
        ctx: &mut ExecutionContext,
    ) -> Result<NormalizedOutput, ExecutionError> {
        let config = self.workflow.parallels.get(&block.id).ok_or_else(|| {
            ExecutionError::Internal(format!("no parallel config for block {}", block.id))
        })?;

        if let Some(existing) = ctx.parallel_execution(&block.id) {
            return Ok(NormalizedOutput::FlowControl(FlowControlOutput {
                current_iteration: existing.current_iteration as u32,
                max_iterations: existing.parallel_count as u32,
                completed: ctx.is_completed(&block.id),
            }));
        }

        let count = config.distribution.count();
        debug!(parallel_id = %block.id, count, "parallel fan-out started");
        ctx.parallel_executions
            .insert(block.id.clone(), ParallelExecution::new(count));

        for conn in self.workflow.outgoing(&block.id) {
            if conn.handle() == Handle::ParallelStart {
                ctx.activate(conn.target.clone());
            }
        }

        Ok(NormalizedOutput::FlowControl(FlowControlOutput {
            current_iteration: 0,
            max_iterations: count as u32,
            completed: false,
        }))
    }

    /// Post-layer pass: once every virtual instance of every active inner node
    /// has executed, latch completion, publish the aggregate under the original
    /// id, and activate the parallel-end edges. An errored iteration turns the
    /// aggregate into the parallel's error output after its siblings finish.
    pub fn process_iterations(&self, ctx: &mut ExecutionContext) -> Vec<String> {
        let mut completed = Vec::new();
        let mut parallel_ids: Vec<&String> = self.workflow.parallels.keys().collect();
        parallel_ids.sort();

        for parallel_id in parallel_ids {
            let config = &self.workflow.parallels[parallel_id];
            if ctx.is_completed(parallel_id) {
                continue;
            }
            let Some(exec) = ctx.parallel_execution(parallel_id) else {
                continue;
            };
            let count = exec.parallel_count;

            let finished: Vec<usize> = (0..count)
                .filter(|k| self.iteration_executed(config, *k, ctx))
                .collect();
            if let Some(exec) = ctx.parallel_executions.get_mut(parallel_id) {
                for k in &finished {
                    exec.active_iterations.remove(k);
                }
            }
            if !self.all_instances_executed(config, count, ctx) {
                continue;
            }

            ctx.mark_completed(parallel_id.clone());
            let results: Vec<NormalizedOutput> = (0..count)
                .map(|k| {
                    ctx.parallel_execution(parallel_id)
                        .and_then(|e| e.results.get(&k).cloned())
                        .unwrap_or_default()
                })
                .collect();
            let first_error = results.iter().find_map(|r| r.as_error().cloned());

            match first_error {
                Some(error) => {
                    debug!(parallel_id = %parallel_id, error = %error.error, "parallel completed with error");
                    ctx.replace_output(
                        &EffectiveId::base(parallel_id),
                        NormalizedOutput::Error(error),
                    );
                    for conn in self.workflow.outgoing(parallel_id) {
                        if conn.handle() == Handle::Error {
                            ctx.activate(conn.target.clone());
                        }
                    }
                }
                None => {
                    debug!(parallel_id = %parallel_id, count, "parallel completed");
                    ctx.replace_output(
                        &EffectiveId::base(parallel_id),
                        NormalizedOutput::Aggregate(AggregateOutput {
                            results: results.iter().map(NormalizedOutput::to_value).collect(),
                            count,
                        }),
                    );
                    for conn in self.workflow.outgoing(parallel_id) {
                        if conn.handle() == Handle::ParallelEnd {
                            ctx.activate(conn.target.clone());
                        }
                    }
                }
            }
            completed.push(parallel_id.clone());
        }
        completed
    }

    fn all_instances_executed(
        &self,
        config: &ParallelConfig,
        count: usize,
        ctx: &ExecutionContext,
    ) -> bool {
        let any_active = config.nodes.iter().any(|n| ctx.is_active(n));
        any_active && (0..count).all(|k| self.iteration_executed(config, k, ctx))
    }

    /// Every active node of iteration `k` has executed.
    fn iteration_executed(&self, config: &ParallelConfig, k: usize, ctx: &ExecutionContext) -> bool {
        config
            .nodes
            .iter()
            .filter(|n| ctx.is_active(n))
            .all(|n| ctx.is_executed(&EffectiveId::instance(n, &config.id, k)))
    }
}
