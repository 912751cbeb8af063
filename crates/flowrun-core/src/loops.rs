//! Loop management: the loop block's own execution (iteration start, forEach
//! item publishing, final-iteration sentinel) and the post-layer pass that
//! resets inner state between iterations and latches completion.

use serde_json::Value;
use tracing::{debug, warn};

use crate::context::{EffectiveId, ExecutionContext};
use crate::error::ExecutionError;
use crate::output::{FlowControlOutput, NormalizedOutput};
use crate::resolver::InputResolver;
use crate::workflow::{Block, Handle, LoopConfig, LoopType, Workflow};

pub struct LoopManager<'w> {
    workflow: &'w Workflow,
}

impl<'w> LoopManager<'w> {
    pub fn new(workflow: &'w Workflow) -> Self {
        Self { workflow }
    }

    /// Execute a loop block: start the next iteration (publishing the current
    /// forEach item) and activate the loop-start edges, or return the
    /// final-iteration sentinel without activating anything so in-flight inner
    /// nodes can finish.
    pub fn execute_loop_block(
        &self,
        block: &Block,
        ctx: &mut ExecutionContext,
        resolver: &InputResolver<'_>,
    ) -> Result<NormalizedOutput, ExecutionError> {
        let config = self.workflow.loops.get(&block.id).ok_or_else(|| {
            ExecutionError::Internal(format!("no loop config for block {}", block.id))
        })?;

        let items = match config.loop_type {
            LoopType::For => None,
            LoopType::ForEach => Some(self.resolve_items(config, block, ctx, resolver)?),
        };
        let max = match &items {
            None => config.iterations,
            Some(items) => items.len() as u32,
        };

        let current = ctx.loop_iteration(&block.id);
        if current >= max {
            // All iterations started; the scheduler lets in-flight nodes drain.
            return Ok(NormalizedOutput::FlowControl(FlowControlOutput {
                current_iteration: current,
                max_iterations: max,
                completed: true,
            }));
        }

        if let Some(items) = items {
            ctx.loop_items
                .insert(block.id.clone(), items[current as usize].clone());
            ctx.loop_collections
                .insert(block.id.clone(), Value::Array(items));
        }
        ctx.loop_iterations.insert(block.id.clone(), current + 1);
        debug!(loop_id = %block.id, iteration = current, max, "loop iteration started");

        for conn in self.workflow.outgoing(&block.id) {
            if conn.handle() == Handle::LoopStart {
                ctx.activate(conn.target.clone());
            }
        }

        Ok(NormalizedOutput::FlowControl(FlowControlOutput {
            current_iteration: current,
            max_iterations: max,
            completed: false,
        }))
    }

    /// Post-layer pass: for every loop whose active inner nodes have all
    /// executed, either reset per-iteration state (more iterations remain) or
    /// latch completion and activate the loop-end edges.
    pub fn process_iterations(&self, ctx: &mut ExecutionContext) -> Vec<String> {
        let mut completed = Vec::new();
        let mut loop_ids: Vec<&String> = self.workflow.loops.keys().collect();
        loop_ids.sort();

        for loop_id in loop_ids {
            let config = &self.workflow.loops[loop_id];
            if ctx.is_completed(loop_id) || !ctx.is_executed(&EffectiveId::base(loop_id)) {
                continue;
            }
            let Some(max) = self.max_iterations(config, ctx) else {
                continue;
            };
            if !self.iteration_finished(config, ctx) {
                continue;
            }

            let current = ctx.loop_iteration(loop_id);
            if current < max {
                debug!(loop_id = %loop_id, iteration = current, "loop iteration finished, resetting");
                self.reset_scope(config, ctx);
                ctx.reset_block(&EffectiveId::base(loop_id));
            } else {
                debug!(loop_id = %loop_id, iterations = current, "loop completed");
                ctx.mark_completed(loop_id.clone());
                for conn in self.workflow.outgoing(loop_id) {
                    if conn.handle() == Handle::LoopEnd {
                        ctx.activate(conn.target.clone());
                    }
                }
                completed.push(loop_id.clone());
            }
        }
        completed
    }

    fn resolve_items(
        &self,
        config: &LoopConfig,
        block: &Block,
        ctx: &ExecutionContext,
        resolver: &InputResolver<'_>,
    ) -> Result<Vec<Value>, ExecutionError> {
        let raw = config
            .for_each_items
            .as_ref()
            .ok_or_else(|| ExecutionError::LoopConfig {
                loop_id: config.id.clone(),
                message: "forEach loop has no items".to_string(),
            })?;
        let resolved = match raw {
            Value::String(expr) => {
                resolver
                    .resolve_expression(expr, block, ctx)
                    .map_err(|e| ExecutionError::LoopConfig {
                        loop_id: config.id.clone(),
                        message: format!("cannot resolve items: {e}"),
                    })?
            }
            other => other.clone(),
        };
        let items = match resolved {
            Value::Array(items) => items,
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                keys.into_iter()
                    .map(|k| Value::Array(vec![Value::String(k.clone()), map[k].clone()]))
                    .collect()
            }
            other => {
                return Err(ExecutionError::LoopConfig {
                    loop_id: config.id.clone(),
                    message: format!("items must be a sequence or mapping, got {other}"),
                });
            }
        };
        if items.is_empty() {
            return Err(ExecutionError::LoopConfig {
                loop_id: config.id.clone(),
                message: "forEach collection is empty".to_string(),
            });
        }
        Ok(items)
    }

    fn max_iterations(&self, config: &LoopConfig, ctx: &ExecutionContext) -> Option<u32> {
        match config.loop_type {
            LoopType::For => Some(config.iterations),
            LoopType::ForEach => ctx
                .loop_collection(&config.id)
                .and_then(Value::as_array)
                .map(|items| items.len() as u32),
        }
    }

    /// All active inner nodes have executed for the current iteration. Inner
    /// nodes off the active path (an untaken condition branch) are ignored;
    /// nested constructs count once they latch completion.
    fn iteration_finished(&self, config: &LoopConfig, ctx: &ExecutionContext) -> bool {
        let mut any_active = false;
        for node in &config.nodes {
            if !ctx.is_active(node) {
                continue;
            }
            any_active = true;
            if !self.node_finished(node, ctx) {
                return false;
            }
        }
        any_active
    }

    fn node_finished(&self, node: &str, ctx: &ExecutionContext) -> bool {
        if self.workflow.loops.contains_key(node) || self.workflow.parallels.contains_key(node) {
            return ctx.is_completed(node);
        }
        ctx.is_executed(&EffectiveId::base(node))
    }

    /// Delete inner per-iteration state so the scheduler re-executes the scope.
    /// Nested loops and parallels reset recursively, including their latches.
    fn reset_scope(&self, config: &LoopConfig, ctx: &mut ExecutionContext) {
        for node in &config.nodes {
            if let Some(nested) = self.workflow.loops.get(node) {
                if nested.id != config.id {
                    self.reset_scope(nested, ctx);
                    ctx.loop_iterations.remove(node);
                    ctx.loop_items.remove(node);
                    ctx.loop_collections.remove(node);
                    ctx.completed_loops.remove(node);
                }
            } else if let Some(parallel) = self.workflow.parallels.get(node) {
                if let Some(exec) = ctx.parallel_executions.remove(node) {
                    for inner in &parallel.nodes {
                        for k in 0..exec.parallel_count {
                            ctx.reset_block(&EffectiveId::instance(inner, node, k));
                        }
                    }
                }
                ctx.completed_loops.remove(node);
            } else if self.workflow.block(node).is_none() {
                warn!(loop_id = %config.id, node, "loop node missing from workflow");
                continue;
            }
            ctx.reset_block(&EffectiveId::base(node));
        }
    }
}
