//! The executor: validates the workflow, seeds the starter, then repeatedly
//! computes the next executable layer, runs it with bounded concurrency, folds
//! routing decisions back into the active path, and advances loop/parallel
//! state until a fixed point is reached.

mod debug;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::context::{
    BlockLog, BlockState, CancelHandle, EffectiveId, ExecutionContext, ParallelInstance,
};
use crate::error::{ExecutionError, ValidationError};
use crate::handler::{
    BlockHandler, ExecutionOutcome, HandlerContext, HandlerRegistry, LoopScope, ParallelScope,
};
use crate::loops::LoopManager;
use crate::observability::{LogOptions, init_logging};
use crate::output::NormalizedOutput;
use crate::parallels::ParallelManager;
use crate::path::PathTracker;
use crate::resolver::{InputResolver, coerce_param};
use crate::streaming::{self, StreamOptions, StreamingExecution};
use crate::workflow::{Block, BlockKind, Handle, ParamType, Workflow};

pub use debug::{DebugSession, StepReport};

/// Hard backstop against graphs that loop without progress.
pub const MAX_ITERATIONS: u32 = 100;

const DEFAULT_LAYER_CONCURRENCY: usize = 8;

/// Tunables for one executor instance.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Upper bound on concurrently running handlers within a layer.
    pub max_layer_concurrency: usize,
    /// Upper bound on scheduling rounds.
    pub max_iterations: u32,
    /// Log setup installed at run entry; the first run in the process wins.
    pub log: LogOptions,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_layer_concurrency: DEFAULT_LAYER_CONCURRENCY,
            max_iterations: MAX_ITERATIONS,
            log: LogOptions::default(),
        }
    }
}

/// Run metadata returned alongside the result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub duration: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub workflow_connections: Vec<crate::workflow::Connection>,
}

/// Final result of one execution.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: NormalizedOutput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<BlockLog>,
    pub metadata: ExecutionMetadata,
}

/// Drives one workflow to completion. Cheap to clone; clones share the
/// cancellation handle and handler registry.
#[derive(Clone)]
pub struct Executor {
    workflow: Arc<Workflow>,
    registry: HandlerRegistry,
    options: ExecutorOptions,
    environment: Arc<HashMap<String, String>>,
    variables: Arc<HashMap<String, Value>>,
    stream: StreamOptions,
    cancel: CancelHandle,
}

impl Executor {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
            registry: HandlerRegistry::new(),
            options: ExecutorOptions::default(),
            environment: Arc::new(HashMap::new()),
            variables: Arc::new(HashMap::new()),
            stream: StreamOptions::default(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, Value>) -> Self {
        self.variables = Arc::new(variables);
        self
    }

    pub fn with_stream(mut self, stream: StreamOptions) -> Self {
        self.stream = stream;
        self
    }

    pub fn register_handler(mut self, handler: Arc<dyn BlockHandler>) -> Self {
        self.registry.register(handler);
        self
    }

    /// Handle for cooperative cancellation of any execution driven by this
    /// executor (or a clone of it).
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Execute the workflow to completion. Validation failures are the only
    /// `Err`; every runtime failure is reported inside the result.
    pub async fn execute(
        &self,
        workflow_id: impl Into<String>,
        input: Value,
    ) -> Result<ExecutionResult, ValidationError> {
        self.workflow.validate()?;
        init_logging(&self.options.log);
        let workflow_id = workflow_id.into();
        info!(workflow_id = %workflow_id, "execution started");
        let mut ctx = self.build_context(workflow_id, &input);
        let outcome = self.drive(&mut ctx).await;
        Ok(self.build_result(ctx, outcome))
    }

    pub(crate) fn build_context(&self, workflow_id: String, input: &Value) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            workflow_id,
            Arc::clone(&self.environment),
            Arc::clone(&self.variables),
            self.stream.clone(),
            self.cancel.clone(),
        );
        if let Some(starter) = self.workflow.starter() {
            let output = seed_starter_output(starter, input);
            ctx.record_block(EffectiveId::base(&starter.id), BlockState::new(output, 0));
            ctx.activate(starter.id.clone());
            for conn in self.workflow.outgoing(&starter.id) {
                if conn.handle() == Handle::Source {
                    ctx.activate(conn.target.clone());
                }
            }
        }
        ctx
    }

    pub(crate) async fn drive(
        &self,
        ctx: &mut ExecutionContext,
    ) -> Result<Option<NormalizedOutput>, ExecutionError> {
        let mut final_output = None;
        for round in 0..self.options.max_iterations {
            if ctx.cancel_handle().is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let outcome = self.run_round(ctx, None).await?;
            if outcome.done {
                debug!(rounds = round, "execution reached fixed point");
                return Ok(final_output);
            }
            if outcome.layer_output.is_some() {
                final_output = outcome.layer_output;
            }
        }
        warn!(limit = self.options.max_iterations, "iteration limit exceeded");
        Err(ExecutionError::IterationLimit)
    }

    /// One scheduling round: compute the next layer (optionally filtered for
    /// debug stepping), execute it, and fold the results into path, loop, and
    /// parallel state.
    pub(crate) async fn run_round(
        &self,
        ctx: &mut ExecutionContext,
        only: Option<&[String]>,
    ) -> Result<RoundOutcome, ExecutionError> {
        let resolver = InputResolver::new(&self.workflow);
        let tracker = PathTracker::new(&self.workflow);
        let loops = LoopManager::new(&self.workflow);
        let parallels = ParallelManager::new(&self.workflow);

        let mut layer = self.next_layer(ctx, &tracker);
        if let Some(filter) = only {
            layer.retain(|id| {
                filter
                    .iter()
                    .any(|f| f == &id.to_string() || f == id.block_id())
            });
        }
        if layer.is_empty() {
            return Ok(RoundOutcome {
                executed: Vec::new(),
                layer_output: None,
                done: true,
            });
        }
        debug!(layer = ?layer.iter().map(ToString::to_string).collect::<Vec<_>>(), "executing layer");

        let layer_output = self
            .execute_layer(&layer, ctx, &resolver, &loops, &parallels)
            .await?;
        tracker.update_execution_paths(&layer, ctx);
        // A completion in one manager can unlock the other (a parallel inside
        // a loop, a loop whose id sorts after its inner loop), so the passes
        // repeat until neither latches anything new. Terminates: each sweep
        // must complete a construct that stays completed within this round.
        loop {
            let completed_loops = loops.process_iterations(ctx);
            let completed_parallels = parallels.process_iterations(ctx);
            if completed_loops.is_empty() && completed_parallels.is_empty() {
                break;
            }
        }

        Ok(RoundOutcome {
            executed: layer,
            layer_output,
            done: false,
        })
    }

    /// Every effective id whose block is enabled, on the active path, not yet
    /// executed, and whose incoming dependencies are resolved. Blocks inside a
    /// parallel are emitted as virtual instances once the fan-out exists.
    pub(crate) fn next_layer(
        &self,
        ctx: &ExecutionContext,
        tracker: &PathTracker<'_>,
    ) -> Vec<EffectiveId> {
        let mut layer = Vec::new();
        for block in &self.workflow.blocks {
            if !block.enabled || block.kind == BlockKind::Starter {
                continue;
            }
            if let Some(parallel) = self.workflow.parallel_containing(&block.id) {
                let Some(exec) = ctx.parallel_execution(&parallel.id) else {
                    continue;
                };
                if ctx.is_completed(&parallel.id) || !tracker.is_in_active_path(&block.id, ctx) {
                    continue;
                }
                for iteration in 0..exec.parallel_count {
                    let id = EffectiveId::instance(&block.id, &parallel.id, iteration);
                    if ctx.is_executed(&id) {
                        continue;
                    }
                    let instance = ParallelInstance {
                        parallel_id: parallel.id.clone(),
                        iteration,
                    };
                    if tracker.dependencies_met(&block.id, ctx, Some(&instance)) {
                        layer.push(id);
                    }
                }
                continue;
            }
            let id = EffectiveId::base(&block.id);
            if ctx.is_executed(&id) || !tracker.is_in_active_path(&block.id, ctx) {
                continue;
            }
            if tracker.dependencies_met(&block.id, ctx, None) {
                layer.push(id);
            }
        }
        layer
    }

    async fn execute_layer(
        &self,
        layer: &[EffectiveId],
        ctx: &mut ExecutionContext,
        resolver: &InputResolver<'_>,
        loops: &LoopManager<'_>,
        parallels: &ParallelManager<'_>,
    ) -> Result<Option<NormalizedOutput>, ExecutionError> {
        let mut prepared = Vec::new();
        let mut streaming_ids: HashSet<EffectiveId> = HashSet::new();

        for id in layer {
            let block = self
                .workflow
                .block(id.block_id())
                .cloned()
                .ok_or_else(|| {
                    ExecutionError::Internal(format!("scheduled unknown block {id}"))
                })?;
            match block.kind {
                BlockKind::Loop => {
                    let started_at = Utc::now();
                    let timer = Instant::now();
                    match loops.execute_loop_block(&block, ctx, resolver) {
                        Ok(output) => {
                            self.record_outcome(ctx, id, &block, None, output, started_at, timer.elapsed());
                        }
                        Err(err) => {
                            self.record_failure(ctx, id, &block, None, &err, started_at, timer.elapsed());
                            if err.is_fatal() {
                                return Err(err);
                            }
                        }
                    }
                }
                BlockKind::Parallel => {
                    let started_at = Utc::now();
                    let timer = Instant::now();
                    match parallels.execute_parallel_block(&block, ctx) {
                        Ok(output) => {
                            self.record_outcome(ctx, id, &block, None, output, started_at, timer.elapsed());
                        }
                        Err(err) => {
                            self.record_failure(ctx, id, &block, None, &err, started_at, timer.elapsed());
                            if err.is_fatal() {
                                return Err(err);
                            }
                        }
                    }
                }
                BlockKind::Workflow => {
                    self.execute_embedded_workflow(id, &block, ctx, resolver).await;
                }
                _ => {
                    ctx.current_virtual = Some(id.clone());
                    let resolved = resolver.resolve_inputs(&block, ctx);
                    ctx.current_virtual = None;
                    match resolved {
                        Ok(inputs) => {
                            let handler = self.registry.resolve(&block);
                            let hctx = self.handler_context(&block, id, ctx);
                            prepared.push((id.clone(), block, inputs, handler, hctx));
                        }
                        Err(err) => {
                            let now = Utc::now();
                            self.record_failure(ctx, id, &block, None, &err, now, Duration::ZERO);
                        }
                    }
                }
            }
        }

        // Run the prepared handlers concurrently under the layer bound. Each
        // future owns its data; all state writes happen here as results land.
        let cancel = ctx.cancel_handle().clone();
        let concurrency = self.options.max_layer_concurrency.max(1);
        let mut results = futures::stream::iter(prepared.into_iter().map(
            |(id, block, inputs, handler, hctx)| async move {
                let started_at = Utc::now();
                let timer = Instant::now();
                let result = handler.execute(&block, inputs.clone(), &hctx).await;
                (id, block, inputs, started_at, timer.elapsed(), result)
            },
        ))
        .buffer_unordered(concurrency);

        let mut pending_streams: Vec<(
            EffectiveId,
            Block,
            Map<String, Value>,
            DateTime<Utc>,
            Duration,
            StreamingExecution,
        )> = Vec::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                next = results.next() => next,
            };
            let Some((id, block, inputs, started_at, elapsed, result)) = next else {
                break;
            };
            match result {
                Ok(ExecutionOutcome::Output(output)) => {
                    self.record_outcome(
                        ctx,
                        &id,
                        &block,
                        Some(Value::Object(inputs)),
                        output,
                        started_at,
                        elapsed,
                    );
                }
                Ok(ExecutionOutcome::Streaming(execution)) => {
                    pending_streams.push((id, block, inputs, started_at, elapsed, execution));
                }
                Err(handler_error) => {
                    let err: ExecutionError = handler_error.into();
                    self.record_failure(
                        ctx,
                        &id,
                        &block,
                        Some(Value::Object(inputs)),
                        &err,
                        started_at,
                        elapsed,
                    );
                }
            }
        }

        // Streams are finalised after the layer's non-streaming work so
        // sibling handlers were never blocked by capture. Dependent blocks only
        // observe the finalised state in the next round.
        for (id, block, inputs, started_at, handler_elapsed, mut execution) in pending_streams {
            streaming_ids.insert(id.clone());
            let timer = Instant::now();
            match streaming::drain(&mut execution, &ctx.stream).await {
                Ok(full_content) => {
                    let response_format = block
                        .param("responseFormat")
                        .is_some_and(|v| !v.is_null());
                    let output = streaming::finalize(execution.seed, full_content, response_format);
                    self.record_outcome(
                        ctx,
                        &id,
                        &block,
                        Some(Value::Object(inputs)),
                        output,
                        started_at,
                        handler_elapsed + timer.elapsed(),
                    );
                }
                Err(handler_error) => {
                    let err: ExecutionError = handler_error.into();
                    self.record_failure(
                        ctx,
                        &id,
                        &block,
                        Some(Value::Object(inputs)),
                        &err,
                        started_at,
                        handler_elapsed + timer.elapsed(),
                    );
                }
            }
        }

        // Final output candidate: the last non-streaming value producer of
        // this layer, in deterministic candidate order.
        let mut layer_output = None;
        for id in layer {
            if streaming_ids.contains(id) {
                continue;
            }
            let Some(block) = self.workflow.block(id.block_id()) else {
                continue;
            };
            if matches!(block.kind, BlockKind::Loop | BlockKind::Parallel) {
                continue;
            }
            if let Some(output) = ctx.output(id) {
                layer_output = Some(output);
            }
        }
        Ok(layer_output)
    }

    /// Embedded workflow blocks run a nested executor sharing the registry,
    /// ambient data, and cancellation handle. A child failure is a block-level
    /// error on the embedding block.
    async fn execute_embedded_workflow(
        &self,
        id: &EffectiveId,
        block: &Block,
        ctx: &mut ExecutionContext,
        resolver: &InputResolver<'_>,
    ) {
        let started_at = Utc::now();
        let timer = Instant::now();

        ctx.current_virtual = Some(id.clone());
        let resolved = resolver.resolve_inputs(block, ctx);
        ctx.current_virtual = None;
        let inputs = match resolved {
            Ok(inputs) => inputs,
            Err(err) => {
                self.record_failure(ctx, id, block, None, &err, started_at, timer.elapsed());
                return;
            }
        };

        let child: Result<Workflow, _> = match inputs.get("workflow") {
            Some(value) => serde_json::from_value(value.clone()),
            None => {
                let err = ExecutionError::Internal(format!(
                    "workflow block {} has no workflow param",
                    block.id
                ));
                self.record_failure(ctx, id, block, None, &err, started_at, timer.elapsed());
                return;
            }
        };
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let err = ExecutionError::Internal(format!("invalid embedded workflow: {e}"));
                self.record_failure(ctx, id, block, None, &err, started_at, timer.elapsed());
                return;
            }
        };

        let child_input = inputs.get("input").cloned().unwrap_or(Value::Null);
        let mut nested = Executor::new(child)
            .with_registry(self.registry.clone())
            .with_options(self.options.clone());
        nested.environment = Arc::clone(&self.environment);
        nested.variables = Arc::clone(&self.variables);
        nested.cancel = ctx.cancel_handle().clone();

        let child_id = format!("{}/{}", ctx.workflow_id, block.id);
        let result = Box::pin(nested.execute(child_id, child_input)).await;
        match result {
            Ok(res) if res.success => {
                let mut map = Map::new();
                map.insert("result".to_string(), res.output.to_value());
                map.insert("success".to_string(), Value::Bool(true));
                self.record_outcome(
                    ctx,
                    id,
                    block,
                    None,
                    NormalizedOutput::Opaque(map),
                    started_at,
                    timer.elapsed(),
                );
            }
            Ok(res) => {
                let message = res
                    .error
                    .unwrap_or_else(|| format_block_error(block, None));
                let err = ExecutionError::Handler {
                    message,
                    status: 500,
                };
                self.record_failure(ctx, id, block, None, &err, started_at, timer.elapsed());
            }
            Err(validation) => {
                let err = ExecutionError::Internal(format!(
                    "embedded workflow is invalid: {validation}"
                ));
                self.record_failure(ctx, id, block, None, &err, started_at, timer.elapsed());
            }
        }
    }

    fn handler_context(
        &self,
        block: &Block,
        id: &EffectiveId,
        ctx: &ExecutionContext,
    ) -> HandlerContext {
        let loop_scope = self.workflow.loop_containing(&block.id).map(|l| LoopScope {
            index: ctx.loop_iteration(&l.id).saturating_sub(1) as usize,
            item: ctx.loop_item(&l.id).cloned(),
            items: ctx.loop_collection(&l.id).cloned(),
        });
        let parallel_scope = id.parallel_instance().map(|instance| ParallelScope {
            index: instance.iteration,
            item: self
                .workflow
                .parallels
                .get(&instance.parallel_id)
                .and_then(|p| p.distribution.item(instance.iteration)),
        });
        HandlerContext {
            workflow_id: ctx.workflow_id.clone(),
            execution_id: ctx.execution_id,
            block_id: id.to_string(),
            environment: Arc::clone(&self.environment),
            variables: Arc::clone(&self.variables),
            loop_scope,
            parallel_scope,
            cancel: ctx.cancel_handle().clone(),
        }
    }

    fn record_outcome(
        &self,
        ctx: &mut ExecutionContext,
        id: &EffectiveId,
        block: &Block,
        input: Option<Value>,
        output: NormalizedOutput,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) {
        let duration_ms = elapsed.as_millis() as u64;
        let success = !output.is_error();
        let error = output.as_error().map(|e| e.error.clone());
        if let Some(instance) = id.parallel_instance().cloned() {
            ctx.record_parallel_result(&instance.parallel_id, instance.iteration, output.clone());
        }
        ctx.push_log(BlockLog {
            block_id: id.to_string(),
            block_name: block.display_name().to_string(),
            block_type: block.kind,
            started_at,
            ended_at: Utc::now(),
            duration_ms,
            success,
            input,
            output: Some(output.to_value()),
            error,
        });
        ctx.record_block(id.clone(), BlockState::new(output, duration_ms));
    }

    fn record_failure(
        &self,
        ctx: &mut ExecutionContext,
        id: &EffectiveId,
        block: &Block,
        input: Option<Value>,
        err: &ExecutionError,
        started_at: DateTime<Utc>,
        elapsed: Duration,
    ) {
        let message = format_block_error(block, Some(err));
        warn!(block = %id, error = %message, "block failed");
        let output = NormalizedOutput::error(message, err.status());
        self.record_outcome(ctx, id, block, input, output, started_at, elapsed);
    }

    pub(crate) fn build_result(
        &self,
        ctx: ExecutionContext,
        outcome: Result<Option<NormalizedOutput>, ExecutionError>,
    ) -> ExecutionResult {
        let metadata = ExecutionMetadata {
            duration: ctx.elapsed_ms(),
            start_time: ctx.started_at(),
            end_time: Utc::now(),
            workflow_connections: self.workflow.connections.clone(),
        };
        match outcome {
            Ok(final_output) => {
                let output = final_output.unwrap_or_default();
                let error = output.as_error().map(|e| e.error.clone());
                info!(
                    workflow_id = %ctx.workflow_id,
                    success = error.is_none(),
                    duration_ms = metadata.duration,
                    "execution finished"
                );
                ExecutionResult {
                    success: error.is_none(),
                    output,
                    error,
                    logs: ctx.block_logs,
                    metadata,
                }
            }
            Err(err) => {
                info!(workflow_id = %ctx.workflow_id, error = %err, "execution failed");
                ExecutionResult {
                    success: false,
                    output: NormalizedOutput::default(),
                    error: Some(err.to_string()),
                    logs: ctx.block_logs,
                    metadata,
                }
            }
        }
    }
}

/// One scheduling round's outcome.
pub(crate) struct RoundOutcome {
    pub executed: Vec<EffectiveId>,
    pub layer_output: Option<NormalizedOutput>,
    pub done: bool,
}

/// Seed the starter's state from the workflow input. With a declared
/// `inputFormat` schema the fields are coerced and stored both nested under
/// `input` and at the top level; free-form objects spread their fields at the
/// top level; anything else is stored under `input`.
fn seed_starter_output(starter: &Block, input: &Value) -> NormalizedOutput {
    if let Some(Value::Array(fields)) = starter.param("inputFormat") {
        let mut structured = Map::new();
        if let Value::Object(given) = input {
            for field in fields {
                let Some(name) = field.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let Some(raw) = given.get(name) else {
                    continue;
                };
                let declared = field
                    .get("type")
                    .and_then(Value::as_str)
                    .and_then(parse_param_type);
                let value = match declared {
                    Some(ty) => {
                        coerce_param(name, raw.clone(), ty).unwrap_or_else(|_| raw.clone())
                    }
                    None => raw.clone(),
                };
                structured.insert(name.to_string(), value);
            }
        }
        let mut map = structured.clone();
        map.insert("input".to_string(), Value::Object(structured));
        return NormalizedOutput::Opaque(map);
    }
    match input {
        Value::Object(map) => NormalizedOutput::Opaque(map.clone()),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other.clone());
            NormalizedOutput::Opaque(map)
        }
    }
}

fn parse_param_type(raw: &str) -> Option<ParamType> {
    match raw {
        "string" => Some(ParamType::String),
        "number" => Some(ParamType::Number),
        "boolean" => Some(ParamType::Boolean),
        "object" => Some(ParamType::Object),
        "array" => Some(ParamType::Array),
        _ => None,
    }
}

/// Error message for a failing block. Empty or opaque messages are rewritten
/// so the user always sees which block failed.
fn format_block_error(block: &Block, err: Option<&ExecutionError>) -> String {
    let message = err.map(ToString::to_string).unwrap_or_default();
    if message.trim().is_empty() || message.contains("undefined") {
        format!(
            "Error executing {} block: {}",
            block.kind.label(),
            block.display_name()
        )
    } else {
        message
    }
}
