//! Per-execution mutable state: block states, logs, the active path, routing
//! decisions, loop/parallel progress, and cancellation. One context per run;
//! all mutation happens through explicit transition methods on the scheduler
//! task, so no lock is needed beyond the shared state table.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::output::NormalizedOutput;
use crate::streaming::StreamOptions;
use crate::workflow::BlockKind;

/// One virtual instance of a block inside a parallel fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParallelInstance {
    pub parallel_id: String,
    pub iteration: usize,
}

/// The effective identity a block executes under: its own id, or a virtual
/// instance of it inside a parallel. The string form
/// `<id>_parallel_<parallelId>_iteration_<i>` is materialised only at the log
/// boundary via `Display`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectiveId {
    block: String,
    instance: Option<ParallelInstance>,
}

impl EffectiveId {
    pub fn base(block: impl Into<String>) -> Self {
        Self {
            block: block.into(),
            instance: None,
        }
    }

    pub fn instance(
        block: impl Into<String>,
        parallel_id: impl Into<String>,
        iteration: usize,
    ) -> Self {
        Self {
            block: block.into(),
            instance: Some(ParallelInstance {
                parallel_id: parallel_id.into(),
                iteration,
            }),
        }
    }

    /// The underlying block id, virtual or not.
    pub fn block_id(&self) -> &str {
        &self.block
    }

    pub fn parallel_instance(&self) -> Option<&ParallelInstance> {
        self.instance.as_ref()
    }

    pub fn is_virtual(&self) -> bool {
        self.instance.is_some()
    }
}

impl fmt::Display for EffectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance {
            None => write!(f, "{}", self.block),
            Some(i) => write!(
                f,
                "{}_parallel_{}_iteration_{}",
                self.block, i.parallel_id, i.iteration
            ),
        }
    }
}

/// State of one executed block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockState {
    pub output: NormalizedOutput,
    pub executed: bool,
    pub execution_time_ms: u64,
}

impl BlockState {
    pub fn new(output: NormalizedOutput, execution_time_ms: u64) -> Self {
        Self {
            output,
            executed: true,
            execution_time_ms,
        }
    }
}

/// One entry in the execution log. Field names are the stable machine-readable
/// record format.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockLog {
    pub block_id: String,
    pub block_name: String,
    pub block_type: BlockKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decisions taken by executed routing blocks.
#[derive(Debug, Clone, Default)]
pub struct Decisions {
    /// Router block -> chosen target block id.
    pub router: HashMap<EffectiveId, String>,
    /// Condition block -> chosen condition id.
    pub condition: HashMap<EffectiveId, String>,
}

/// Fan-out state of one parallel construct.
#[derive(Debug, Clone)]
pub struct ParallelExecution {
    pub parallel_count: usize,
    pub current_iteration: usize,
    /// Per-iteration result (the last node of that iteration to finish).
    pub results: BTreeMap<usize, NormalizedOutput>,
    pub active_iterations: BTreeSet<usize>,
}

impl ParallelExecution {
    pub fn new(parallel_count: usize) -> Self {
        Self {
            parallel_count,
            current_iteration: 0,
            results: BTreeMap::new(),
            active_iterations: (0..parallel_count).collect(),
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation handle carried in the context and handed to
/// handlers. Cloning shares the same underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.state.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared, run-scoped table of block states.
pub type SharedBlockStates = Arc<DashMap<EffectiveId, BlockState>>;

/// Mutable state of one workflow execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub execution_id: Uuid,
    block_states: SharedBlockStates,
    pub(crate) block_logs: Vec<BlockLog>,
    pub(crate) executed: HashSet<EffectiveId>,
    pub(crate) active_path: HashSet<String>,
    pub(crate) decisions: Decisions,
    pub(crate) loop_iterations: HashMap<String, u32>,
    pub(crate) loop_items: HashMap<String, Value>,
    pub(crate) loop_collections: HashMap<String, Value>,
    pub(crate) completed_loops: HashSet<String>,
    pub(crate) parallel_executions: HashMap<String, ParallelExecution>,
    pub(crate) current_virtual: Option<EffectiveId>,
    pub(crate) environment: Arc<HashMap<String, String>>,
    pub(crate) variables: Arc<HashMap<String, Value>>,
    pub(crate) stream: StreamOptions,
    pub(crate) cancel: CancelHandle,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) started_instant: Instant,
}

impl ExecutionContext {
    pub fn new(
        workflow_id: impl Into<String>,
        environment: Arc<HashMap<String, String>>,
        variables: Arc<HashMap<String, Value>>,
        stream: StreamOptions,
        cancel: CancelHandle,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4(),
            block_states: Arc::new(DashMap::new()),
            block_logs: Vec::new(),
            executed: HashSet::new(),
            active_path: HashSet::new(),
            decisions: Decisions::default(),
            loop_iterations: HashMap::new(),
            loop_items: HashMap::new(),
            loop_collections: HashMap::new(),
            completed_loops: HashSet::new(),
            parallel_executions: HashMap::new(),
            current_virtual: None,
            environment,
            variables,
            stream,
            cancel,
            started_at: Utc::now(),
            started_instant: Instant::now(),
        }
    }

    // Block state table.

    pub fn state(&self, id: &EffectiveId) -> Option<BlockState> {
        self.block_states.get(id).map(|s| s.clone())
    }

    pub fn output(&self, id: &EffectiveId) -> Option<NormalizedOutput> {
        self.block_states.get(id).map(|s| s.output.clone())
    }

    pub fn has_state(&self, id: &EffectiveId) -> bool {
        self.block_states.contains_key(id)
    }

    /// Record a block's state and mark it executed. At most one state per
    /// effective id exists at any time; loop resets delete before re-execution.
    pub fn record_block(&mut self, id: EffectiveId, state: BlockState) {
        self.block_states.insert(id.clone(), state);
        self.executed.insert(id);
    }

    /// Replace a block's output in place (parallel aggregation, stream
    /// finalisation) without touching the executed set.
    pub fn replace_output(&mut self, id: &EffectiveId, output: NormalizedOutput) {
        if let Some(mut state) = self.block_states.get_mut(id) {
            state.output = output;
        }
    }

    /// Remove one block's per-iteration state so the scheduler re-executes it.
    pub fn reset_block(&mut self, id: &EffectiveId) {
        self.block_states.remove(id);
        self.executed.remove(id);
        self.decisions.router.remove(id);
        self.decisions.condition.remove(id);
    }

    pub fn shared_states(&self) -> SharedBlockStates {
        Arc::clone(&self.block_states)
    }

    // Execution bookkeeping.

    pub fn is_executed(&self, id: &EffectiveId) -> bool {
        self.executed.contains(id)
    }

    pub fn executed_ids(&self) -> &HashSet<EffectiveId> {
        &self.executed
    }

    pub fn activate(&mut self, block_id: impl Into<String>) {
        self.active_path.insert(block_id.into());
    }

    pub fn is_active(&self, block_id: &str) -> bool {
        self.active_path.contains(block_id)
    }

    pub fn push_log(&mut self, log: BlockLog) {
        self.block_logs.push(log);
    }

    pub fn logs(&self) -> &[BlockLog] {
        &self.block_logs
    }

    // Routing decisions.

    pub fn router_decision(&self, id: &EffectiveId) -> Option<&str> {
        self.decisions.router.get(id).map(String::as_str)
    }

    pub fn condition_decision(&self, id: &EffectiveId) -> Option<&str> {
        self.decisions.condition.get(id).map(String::as_str)
    }

    // Loop state.

    pub fn loop_iteration(&self, loop_id: &str) -> u32 {
        self.loop_iterations.get(loop_id).copied().unwrap_or(0)
    }

    pub fn loop_item(&self, loop_id: &str) -> Option<&Value> {
        self.loop_items.get(loop_id)
    }

    pub fn loop_collection(&self, loop_id: &str) -> Option<&Value> {
        self.loop_collections.get(loop_id)
    }

    pub fn is_completed(&self, construct_id: &str) -> bool {
        self.completed_loops.contains(construct_id)
    }

    /// Latch completion of a loop or parallel. Monotonic within one execution.
    pub fn mark_completed(&mut self, construct_id: impl Into<String>) {
        self.completed_loops.insert(construct_id.into());
    }

    // Parallel state.

    pub fn parallel_execution(&self, parallel_id: &str) -> Option<&ParallelExecution> {
        self.parallel_executions.get(parallel_id)
    }

    /// Record one iteration's result for aggregation. The last block of an
    /// iteration to finish provides that iteration's entry.
    pub fn record_parallel_result(
        &mut self,
        parallel_id: &str,
        iteration: usize,
        output: NormalizedOutput,
    ) {
        if let Some(exec) = self.parallel_executions.get_mut(parallel_id) {
            exec.current_iteration = exec.current_iteration.max(iteration);
            exec.results.insert(iteration, output);
        }
    }

    // Ambient data.

    pub fn environment(&self) -> &Arc<HashMap<String, String>> {
        &self.environment
    }

    pub fn variables(&self) -> &Arc<HashMap<String, Value>> {
        &self.variables
    }

    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_instant.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(
            "wf",
            Arc::new(HashMap::new()),
            Arc::new(HashMap::new()),
            StreamOptions::default(),
            CancelHandle::new(),
        )
    }

    #[test]
    fn effective_id_display_forms() {
        assert_eq!(EffectiveId::base("b1").to_string(), "b1");
        assert_eq!(
            EffectiveId::instance("b1", "p1", 2).to_string(),
            "b1_parallel_p1_iteration_2"
        );
        assert!(!EffectiveId::base("b1").is_virtual());
        assert!(EffectiveId::instance("b1", "p1", 0).is_virtual());
    }

    #[test]
    fn record_and_reset_block() {
        let mut ctx = ctx();
        let id = EffectiveId::base("a");
        ctx.record_block(
            id.clone(),
            BlockState::new(NormalizedOutput::from_value(json!({"x": 1})), 3),
        );
        assert!(ctx.is_executed(&id));
        assert_eq!(ctx.output(&id).unwrap().get("x"), Some(json!(1)));

        ctx.reset_block(&id);
        assert!(!ctx.is_executed(&id));
        assert!(ctx.state(&id).is_none());
    }

    #[test]
    fn completion_latch_is_monotonic() {
        let mut ctx = ctx();
        assert!(!ctx.is_completed("loop1"));
        ctx.mark_completed("loop1");
        ctx.mark_completed("loop1");
        assert!(ctx.is_completed("loop1"));
    }

    #[tokio::test]
    async fn cancel_handle_resolves_waiters() {
        let cancel = CancelHandle::new();
        let waiter = cancel.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        cancel.cancel();
        task.await.unwrap();
        assert!(cancel.is_cancelled());
    }
}
