//! Active-path tracking. Maintains which blocks the engine currently considers
//! reachable given routing decisions, error states, and loop/parallel progress,
//! and evaluates per-connection activity for dependency checks.

use std::collections::HashSet;

use tracing::debug;

use crate::context::{EffectiveId, ExecutionContext, ParallelInstance};
use crate::output::NormalizedOutput;
use crate::routing::{Category, should_skip_connection};
use crate::workflow::{BlockKind, Connection, Handle, Workflow};

/// Activity of one incoming connection for dependency purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    /// The edge fires: its source executed and the handle predicate holds.
    Active,
    /// The edge is resolved and will not fire (wrong branch, inactive source,
    /// mismatched error state). Non-blocking.
    Inactive,
    /// The edge cannot be judged yet; the target must wait.
    Pending,
}

pub struct PathTracker<'w> {
    workflow: &'w Workflow,
}

impl<'w> PathTracker<'w> {
    pub fn new(workflow: &'w Workflow) -> Self {
        Self { workflow }
    }

    /// Whether `block_id` is on the active execution path.
    pub fn is_in_active_path(&self, block_id: &str, ctx: &ExecutionContext) -> bool {
        if ctx.is_active(block_id) {
            return true;
        }
        self.workflow
            .incoming(block_id)
            .any(|conn| self.edge_status(conn, ctx, None) == EdgeStatus::Active)
    }

    /// Evaluate one connection. `target_instance` carries the parallel
    /// iteration of the target so sibling dependencies resolve to the same
    /// iteration's virtual source.
    pub fn edge_status(
        &self,
        conn: &Connection,
        ctx: &ExecutionContext,
        target_instance: Option<&ParallelInstance>,
    ) -> EdgeStatus {
        if !ctx.is_active(&conn.source) {
            return EdgeStatus::Inactive;
        }
        let source_kind = match self.workflow.block(&conn.source) {
            Some(b) => b.kind,
            None => return EdgeStatus::Inactive,
        };
        let source_id = self.source_effective_id(conn, target_instance);

        match conn.handle() {
            Handle::LoopEnd | Handle::ParallelEnd => {
                if ctx.is_completed(&conn.source) {
                    EdgeStatus::Active
                } else {
                    EdgeStatus::Pending
                }
            }
            Handle::LoopStart | Handle::ParallelStart => {
                if ctx.is_executed(&EffectiveId::base(&conn.source)) {
                    EdgeStatus::Active
                } else {
                    EdgeStatus::Pending
                }
            }
            Handle::Error => match self.executed_output(&source_id, ctx) {
                None => EdgeStatus::Pending,
                Some(output) if output.is_error() => EdgeStatus::Active,
                Some(_) => EdgeStatus::Inactive,
            },
            Handle::Condition(condition_id) => match self.executed_output(&source_id, ctx) {
                None => EdgeStatus::Pending,
                Some(_) => {
                    if ctx.condition_decision(&source_id) == Some(condition_id.as_str()) {
                        EdgeStatus::Active
                    } else {
                        EdgeStatus::Inactive
                    }
                }
            },
            Handle::Source if source_kind == BlockKind::Router => {
                match self.executed_output(&source_id, ctx) {
                    None => EdgeStatus::Pending,
                    Some(_) => {
                        if ctx.router_decision(&source_id) == Some(conn.target.as_str()) {
                            EdgeStatus::Active
                        } else {
                            EdgeStatus::Inactive
                        }
                    }
                }
            }
            Handle::Source => match self.executed_output(&source_id, ctx) {
                None => EdgeStatus::Pending,
                Some(output) if output.is_error() => EdgeStatus::Inactive,
                Some(_) => EdgeStatus::Active,
            },
        }
    }

    /// Whether every incoming dependency of `block_id` is resolved with at
    /// least one edge firing.
    pub fn dependencies_met(
        &self,
        block_id: &str,
        ctx: &ExecutionContext,
        target_instance: Option<&ParallelInstance>,
    ) -> bool {
        let mut any_active = false;
        for conn in self.workflow.incoming(block_id) {
            match self.edge_status(conn, ctx, target_instance) {
                EdgeStatus::Pending => return false,
                EdgeStatus::Active => any_active = true,
                EdgeStatus::Inactive => {}
            }
        }
        any_active
    }

    /// Fold the layer's results back into the active path: record routing
    /// decisions and activate chosen targets (with their downstream closure
    /// for regular targets), follow normal edges on success and error edges on
    /// failure. Loop and parallel children are manager-owned and untouched.
    pub fn update_execution_paths(&self, executed: &[EffectiveId], ctx: &mut ExecutionContext) {
        for effective in executed {
            let Some(block) = self.workflow.block(effective.block_id()) else {
                continue;
            };
            let Some(output) = ctx.output(effective) else {
                continue;
            };

            if output.is_error() {
                for conn in self.workflow.outgoing(&block.id) {
                    if conn.handle() == Handle::Error {
                        ctx.activate(conn.target.clone());
                    }
                }
                continue;
            }

            match block.kind.category() {
                Category::Routing => self.fold_decision(block.kind, effective, &output, ctx),
                Category::FlowControl => {}
                Category::Regular => {
                    for conn in self.workflow.outgoing(&block.id) {
                        if conn.handle() == Handle::Source {
                            ctx.activate(conn.target.clone());
                        }
                    }
                }
            }
        }
    }

    fn fold_decision(
        &self,
        kind: BlockKind,
        effective: &EffectiveId,
        output: &NormalizedOutput,
        ctx: &mut ExecutionContext,
    ) {
        match (kind, output) {
            (BlockKind::Router, NormalizedOutput::Router(decision)) => {
                let target = decision.selected_path.clone();
                debug!(router = %effective, %target, "router decision");
                ctx.decisions
                    .router
                    .insert(effective.clone(), target.clone());
                self.activate_chosen_target(&target, ctx);
            }
            (BlockKind::Condition, NormalizedOutput::Condition(decision)) => {
                let selected = decision.selected_condition_id.clone();
                debug!(condition = %effective, %selected, "condition decision");
                ctx.decisions
                    .condition
                    .insert(effective.clone(), selected.clone());
                let targets: Vec<String> = self
                    .workflow
                    .outgoing(effective.block_id())
                    .filter(|c| c.handle() == Handle::Condition(selected.clone()))
                    .map(|c| c.target.clone())
                    .collect();
                for target in targets {
                    self.activate_chosen_target(&target, ctx);
                }
            }
            _ => {}
        }
    }

    fn activate_chosen_target(&self, target: &str, ctx: &mut ExecutionContext) {
        let mut visited = HashSet::new();
        self.activate_downstream(target, ctx, &mut visited);
    }

    /// Recursively activate a chosen target and, for regular blocks only, its
    /// downstream closure. Recursion stops at routing and flow-control blocks
    /// and skips manager-owned or error-gated handles; the visited set guards
    /// against cycles.
    fn activate_downstream(
        &self,
        block_id: &str,
        ctx: &mut ExecutionContext,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(block_id.to_string()) {
            return;
        }
        ctx.activate(block_id.to_string());
        let Some(block) = self.workflow.block(block_id) else {
            return;
        };
        if block.kind.category() != Category::Regular {
            return;
        }
        let next: Vec<String> = self
            .workflow
            .outgoing(block_id)
            .filter(|conn| {
                self.workflow
                    .block(&conn.target)
                    .is_some_and(|t| !should_skip_connection(&conn.handle(), t.kind))
            })
            .map(|conn| conn.target.clone())
            .collect();
        for target in next {
            self.activate_downstream(&target, ctx, visited);
        }
    }

    fn source_effective_id(
        &self,
        conn: &Connection,
        target_instance: Option<&ParallelInstance>,
    ) -> EffectiveId {
        if let Some(instance) = target_instance
            && self
                .workflow
                .parallels
                .get(&instance.parallel_id)
                .is_some_and(|p| p.nodes.iter().any(|n| *n == conn.source))
        {
            return EffectiveId::instance(&conn.source, &instance.parallel_id, instance.iteration);
        }
        EffectiveId::base(&conn.source)
    }

    fn executed_output(
        &self,
        source: &EffectiveId,
        ctx: &ExecutionContext,
    ) -> Option<NormalizedOutput> {
        if !ctx.is_executed(source) {
            return None;
        }
        ctx.output(source)
    }
}
