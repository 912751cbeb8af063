//! End-to-end executions over the public API: loops, forEach, parallel
//! fan-out, routing, error paths, streaming, embedded workflows, debug
//! stepping, cancellation, and the iteration-limit backstop. Domain handlers
//! are stubbed inline; flow control is entirely engine-driven.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use flowrun_core::handler::{BlockHandler, ExecutionOutcome, HandlerContext};
use flowrun_core::output::{AgentOutput, ConditionOutput, NormalizedOutput, RouterOutput};
use flowrun_core::streaming::stream_from_chunks;
use flowrun_core::workflow::{Block, BlockKind, LoopConfig, ParallelConfig, Workflow};
use flowrun_core::{
    ExecutionResult, Executor, ExecutorOptions, HandlerError, HandlerRegistry, LogFormat,
    LogOptions, StreamEvent, StreamOptions, StreamingExecution,
};

/// Router stub: routes to the target named by the resolved `target` param.
struct ParamRouter;

#[async_trait]
impl BlockHandler for ParamRouter {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Router
    }

    async fn execute(
        &self,
        _block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let target = inputs
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("no target"))?;
        Ok(ExecutionOutcome::Output(NormalizedOutput::Router(
            RouterOutput {
                selected_path: target.to_string(),
                content: None,
            },
        )))
    }
}

/// Condition stub: selects the condition id named by the `selected` param.
struct ParamCondition;

#[async_trait]
impl BlockHandler for ParamCondition {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Condition
    }

    async fn execute(
        &self,
        _block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let selected = inputs
            .get("selected")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::new("no selected"))?;
        Ok(ExecutionOutcome::Output(NormalizedOutput::Condition(
            ConditionOutput {
                selected_condition_id: selected.to_string(),
                content: None,
            },
        )))
    }
}

/// Fails every block whose name is "boom".
struct Exploder;

#[async_trait]
impl BlockHandler for Exploder {
    fn can_handle(&self, block: &Block) -> bool {
        block.name == "boom"
    }

    async fn execute(
        &self,
        _block: &Block,
        _inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        Err(HandlerError::with_status("kaboom", 500))
    }
}

/// Streaming agent stub: emits fixed chunks, metadata in the seed.
struct StreamingAgent;

#[async_trait]
impl BlockHandler for StreamingAgent {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Agent
    }

    async fn execute(
        &self,
        _block: &Block,
        _inputs: Map<String, Value>,
        ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        Ok(ExecutionOutcome::Streaming(StreamingExecution::new(
            ctx.block_id.clone(),
            stream_from_chunks(vec!["Hel".to_string(), "lo".to_string()]),
            NormalizedOutput::Agent(AgentOutput {
                model: Some("stub-1".to_string()),
                ..AgentOutput::default()
            }),
        )))
    }
}

/// Sleeps long enough that only cancellation ends it.
struct Sleeper;

#[async_trait]
impl BlockHandler for Sleeper {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Function
    }

    async fn execute(
        &self,
        _block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ExecutionOutcome::Output(NormalizedOutput::Opaque(inputs)))
    }
}

fn registry(handlers: Vec<Arc<dyn BlockHandler>>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for handler in handlers {
        registry.register(handler);
    }
    registry
}

fn logs_for<'r>(result: &'r ExecutionResult, block_id: &str) -> Vec<&'r flowrun_core::BlockLog> {
    result
        .logs
        .iter()
        .filter(|l| l.block_id == block_id)
        .collect()
}

#[tokio::test]
async fn linear_for_loop_runs_three_iterations() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("loopA", BlockKind::Loop))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("i", "<loop.index>"))
        .add_block(Block::new("respC", BlockKind::Response).with_param("last", "<funcB.i>"))
        .connect("start", "loopA")
        .connect_handle("loopA", "funcB", "loop-start-source")
        .connect_handle("loopA", "respC", "loop-end-source")
        .add_loop(LoopConfig::for_count("loopA", vec!["funcB".into()], 3))
        .build();

    let result = Executor::new(wf).execute("wf-loop", json!({})).await.unwrap();
    assert!(result.success, "error: {:?}", result.error);

    let func_logs = logs_for(&result, "funcB");
    assert_eq!(func_logs.len(), 3);
    let indices: Vec<Value> = func_logs
        .iter()
        .map(|l| l.output.as_ref().unwrap()["i"].clone())
        .collect();
    assert_eq!(indices, vec![json!(0), json!(1), json!(2)]);

    assert_eq!(logs_for(&result, "respC").len(), 1);
    assert_eq!(result.output.get("last"), Some(json!(2)));
}

#[tokio::test]
async fn for_each_over_string_array() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("loopA", BlockKind::Loop))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("item", "<loop.currentItem>"))
        .add_block(Block::new("respC", BlockKind::Response).with_param("last", "<funcB.item>"))
        .connect("start", "loopA")
        .connect_handle("loopA", "funcB", "loop-start-source")
        .connect_handle("loopA", "respC", "loop-end-source")
        .add_loop(LoopConfig::for_each(
            "loopA",
            vec!["funcB".into()],
            json!(["a", "b"]),
        ))
        .build();

    let result = Executor::new(wf).execute("wf-foreach", json!({})).await.unwrap();
    assert!(result.success, "error: {:?}", result.error);

    let items: Vec<Value> = logs_for(&result, "funcB")
        .iter()
        .map(|l| l.output.as_ref().unwrap()["item"].clone())
        .collect();
    assert_eq!(items, vec![json!("a"), json!("b")]);
    assert_eq!(result.output.get("last"), Some(json!("b")));
}

#[tokio::test]
async fn nested_loops_multiply_iterations() {
    // outer (2) wraps inner (2): the innermost function runs four times and
    // the inner loop's counters restart on every outer iteration.
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("outerL", BlockKind::Loop))
        .add_block(Block::new("innerL", BlockKind::Loop))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("i", "<loop.index>"))
        .add_block(Block::new("respC", BlockKind::Response).with_param("last", "<funcB.i>"))
        .connect("start", "outerL")
        .connect_handle("outerL", "innerL", "loop-start-source")
        .connect_handle("innerL", "funcB", "loop-start-source")
        .connect_handle("outerL", "respC", "loop-end-source")
        .add_loop(LoopConfig::for_count("outerL", vec!["innerL".into()], 2))
        .add_loop(LoopConfig::for_count("innerL", vec!["funcB".into()], 2))
        .build();

    let result = Executor::new(wf).execute("wf-nested", json!({})).await.unwrap();
    assert!(result.success, "error: {:?}", result.error);

    let func_logs = logs_for(&result, "funcB");
    assert_eq!(func_logs.len(), 4);
    // funcB sits in the inner loop, so its index restarts per outer iteration.
    let indices: Vec<Value> = func_logs
        .iter()
        .map(|l| l.output.as_ref().unwrap()["i"].clone())
        .collect();
    assert_eq!(indices, vec![json!(0), json!(1), json!(0), json!(1)]);
    assert_eq!(logs_for(&result, "respC").len(), 1);
    assert_eq!(result.output.get("last"), Some(json!(1)));
}

#[tokio::test]
async fn parallel_fan_out_of_three_aggregates_in_order() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("parallelP", BlockKind::Parallel))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("k", "<parallel.index>"))
        .add_block(
            Block::new("respC", BlockKind::Response)
                .with_param("agg", "<parallelP.results>")
                .with_param("count", "<parallelP.count>"),
        )
        .connect("start", "parallelP")
        .connect_handle("parallelP", "funcB", "parallel-start-source")
        .connect_handle("parallelP", "respC", "parallel-end-source")
        .add_parallel(ParallelConfig::fan_out("parallelP", vec!["funcB".into()], 3))
        .build();

    let result = Executor::new(wf)
        .execute("wf-parallel", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);

    for k in 0..3 {
        let virtual_id = format!("funcB_parallel_parallelP_iteration_{k}");
        assert_eq!(logs_for(&result, &virtual_id).len(), 1);
    }
    assert_eq!(
        result.output.get("agg"),
        Some(json!([{"k": 0}, {"k": 1}, {"k": 2}]))
    );
    assert_eq!(result.output.get("count"), Some(json!(3)));
    assert_eq!(logs_for(&result, "respC").len(), 1);
}

#[tokio::test]
async fn parallel_inside_loop_re_fans_out_each_iteration() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("loopL", BlockKind::Loop))
        .add_block(Block::new("p", BlockKind::Parallel))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("k", "<parallel.index>"))
        .add_block(Block::new("respC", BlockKind::Response).with_param("agg", "<p.results>"))
        .connect("start", "loopL")
        .connect_handle("loopL", "p", "loop-start-source")
        .connect_handle("p", "funcB", "parallel-start-source")
        .connect_handle("loopL", "respC", "loop-end-source")
        .add_loop(LoopConfig::for_count("loopL", vec!["p".into()], 2))
        .add_parallel(ParallelConfig::fan_out("p", vec!["funcB".into()], 2))
        .build();

    let result = Executor::new(wf)
        .execute("wf-parallel-in-loop", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);

    // Two loop iterations, each fanning out twice.
    let func_logs: Vec<_> = result
        .logs
        .iter()
        .filter(|l| l.block_id.starts_with("funcB_parallel_p_iteration_"))
        .collect();
    assert_eq!(func_logs.len(), 4);
    assert_eq!(result.output.get("agg"), Some(json!([{"k": 0}, {"k": 1}])));
}

#[tokio::test]
async fn router_choice_activates_only_chosen_subtree() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("routerR", BlockKind::Router).with_param("target", "b"))
        .add_block(Block::new("b", BlockKind::Function).with_param("from", "b"))
        .add_block(Block::new("c", BlockKind::Function).with_param("from", "c"))
        .add_block(Block::new("d", BlockKind::Function).with_param("via", "<b.from>"))
        .connect("start", "routerR")
        .connect("routerR", "b")
        .connect("routerR", "c")
        .connect("b", "d")
        .build();

    let result = Executor::new(wf)
        .with_registry(registry(vec![Arc::new(ParamRouter)]))
        .execute("wf-router", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);

    assert_eq!(logs_for(&result, "b").len(), 1);
    assert_eq!(logs_for(&result, "d").len(), 1);
    assert!(logs_for(&result, "c").is_empty());
    assert_eq!(result.output.get("via"), Some(json!("b")));
}

#[tokio::test]
async fn condition_else_with_error_path_recovers() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("condX", BlockKind::Condition).with_param("selected", "else"))
        .add_block(Block::new("okB", BlockKind::Function).with_param("from", "ok"))
        .add_block(Block::new("failB", BlockKind::Function).with_name("boom"))
        .add_block(Block::new("rescue", BlockKind::Function).with_param("msg", "<failB.error>"))
        .connect("start", "condX")
        .connect_handle("condX", "okB", "condition-if")
        .connect_handle("condX", "failB", "condition-else")
        .connect_handle("failB", "rescue", "error")
        .build();

    let result = Executor::new(wf)
        .with_registry(registry(vec![Arc::new(ParamCondition), Arc::new(Exploder)]))
        .execute("wf-condition", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);

    assert!(logs_for(&result, "okB").is_empty());
    let fail_logs = logs_for(&result, "failB");
    assert_eq!(fail_logs.len(), 1);
    assert!(!fail_logs[0].success);
    assert_eq!(fail_logs[0].error.as_deref(), Some("kaboom"));

    let rescue_logs = logs_for(&result, "rescue");
    assert_eq!(rescue_logs.len(), 1);
    assert!(rescue_logs[0].success);
    assert_eq!(result.output.get("msg"), Some(json!("kaboom")));
}

#[tokio::test]
async fn streaming_agent_finalises_before_dependents() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("agentA", BlockKind::Agent))
        .add_block(Block::new("respB", BlockKind::Response).with_param("text", "<agentA.content>"))
        .connect("start", "agentA")
        .connect("agentA", "respB")
        .build();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let result = Executor::new(wf)
        .with_registry(registry(vec![Arc::new(StreamingAgent)]))
        .with_stream(StreamOptions::forward_to(tx))
        .execute("wf-stream", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events,
        vec![
            StreamEvent::Chunk {
                block_id: "agentA".to_string(),
                content: "Hel".to_string()
            },
            StreamEvent::Chunk {
                block_id: "agentA".to_string(),
                content: "lo".to_string()
            },
            StreamEvent::Done {
                block_id: "agentA".to_string()
            },
        ]
    );

    assert_eq!(result.output.get("text"), Some(json!("Hello")));
    let agent_log = &logs_for(&result, "agentA")[0];
    let resp_log = &logs_for(&result, "respB")[0];
    assert!(agent_log.output.as_ref().unwrap()["content"] == json!("Hello"));
    assert!(agent_log.ended_at <= resp_log.started_at);
}

#[tokio::test]
async fn failing_sibling_does_not_stop_the_layer() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("bad", BlockKind::Function).with_name("boom"))
        .add_block(Block::new("good", BlockKind::Function).with_param("v", 1))
        .add_block(Block::new("after_bad", BlockKind::Function).with_param("v", "<bad.v>"))
        .add_block(Block::new("resp", BlockKind::Response).with_param("v", "<good.v>"))
        .connect("start", "bad")
        .connect("start", "good")
        .connect("bad", "after_bad")
        .connect("good", "resp")
        .build();

    let result = Executor::new(wf)
        .with_registry(registry(vec![Arc::new(Exploder)]))
        .execute("wf-sibling", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(logs_for(&result, "good").len(), 1);
    assert_eq!(logs_for(&result, "resp").len(), 1);
    // The failed block's subtree never becomes ready.
    assert!(logs_for(&result, "after_bad").is_empty());
    assert!(!logs_for(&result, "bad")[0].success);
}

#[tokio::test]
async fn empty_runtime_for_each_collection_fails_the_run() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("loopA", BlockKind::Loop))
        .add_block(Block::new("funcB", BlockKind::Function))
        .connect("start", "loopA")
        .connect_handle("loopA", "funcB", "loop-start-source")
        .add_loop(LoopConfig::for_each(
            "loopA",
            vec!["funcB".into()],
            json!("<start.items>"),
        ))
        .build();

    let result = Executor::new(wf)
        .execute("wf-empty-items", json!({"items": []}))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.as_ref().unwrap().contains("empty"));
    assert!(logs_for(&result, "funcB").is_empty());
}

#[tokio::test]
async fn iteration_limit_caps_runaway_loops() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("loopA", BlockKind::Loop))
        .add_block(Block::new("funcB", BlockKind::Function))
        .connect("start", "loopA")
        .connect_handle("loopA", "funcB", "loop-start-source")
        .add_loop(LoopConfig::for_count("loopA", vec!["funcB".into()], 500))
        .build();

    let result = Executor::new(wf)
        .execute("wf-runaway", json!({}))
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("iteration limit exceeded"));
}

#[tokio::test]
async fn cancellation_aborts_pending_handlers() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("slow", BlockKind::Function))
        .connect("start", "slow")
        .build();

    let executor = Executor::new(wf).with_registry(registry(vec![Arc::new(Sleeper)]));
    let cancel = executor.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute("wf-cancel", json!({})),
    )
    .await
    .expect("cancellation must end the run promptly")
    .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn embedded_workflow_runs_to_completion() {
    let child = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("inner", BlockKind::Function).with_param("echo", "<start.input>"))
        .connect("start", "inner")
        .build();

    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(
            Block::new("sub", BlockKind::Workflow)
                .with_param("workflow", serde_json::to_value(&child).unwrap())
                .with_param("input", "<start.name>"),
        )
        .add_block(Block::new("resp", BlockKind::Response).with_param("nested", "<sub.result>"))
        .connect("start", "sub")
        .connect("sub", "resp")
        .build();

    let result = Executor::new(wf)
        .execute("wf-embed", json!({"name": "outer"}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(
        result.output.get("nested"),
        Some(json!({"echo": "outer"}))
    );
}

#[tokio::test]
async fn debug_session_steps_layer_by_layer() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("a", BlockKind::Function).with_param("v", 1))
        .add_block(Block::new("b", BlockKind::Function).with_param("w", "<a.v>"))
        .connect("start", "a")
        .connect("a", "b")
        .build();

    let executor = Executor::new(wf);
    let mut session = executor.debug_session("wf-debug", json!({})).unwrap();
    assert_eq!(session.pending(), vec!["a".to_string()]);

    let report = session.step().await;
    assert_eq!(report.executed, vec!["a".to_string()]);
    assert_eq!(report.pending, vec!["b".to_string()]);
    assert!(!report.done);

    let result = session.finish().await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.output.get("w"), Some(json!(1)));
}

#[tokio::test]
async fn execution_installs_logging_cleanly() {
    let wf = || {
        Workflow::builder()
            .add_block(Block::new("start", BlockKind::Starter))
            .add_block(Block::new("fn1", BlockKind::Function).with_param("v", 1))
            .connect("start", "fn1")
            .build()
    };
    // Both runs route through the logging once-guard: the first executor in
    // the process installs the subscriber, the second's differing options are
    // a no-op, and neither disturbs the run itself.
    let first = Executor::new(wf()).execute("wf-log-a", json!({})).await.unwrap();
    let second = Executor::new(wf())
        .with_options(ExecutorOptions {
            log: LogOptions {
                format: LogFormat::Json,
                ..LogOptions::default()
            },
            ..ExecutorOptions::default()
        })
        .execute("wf-log-b", json!({})).await.unwrap();
    assert!(first.success, "error: {:?}", first.error);
    assert!(second.success, "error: {:?}", second.error);
    assert_eq!(first.output.get("v"), Some(json!(1)));
    assert_eq!(second.output.get("v"), Some(json!(1)));
}

#[tokio::test]
async fn disabled_blocks_never_execute() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("off", BlockKind::Function).disabled())
        .add_block(Block::new("on", BlockKind::Function).with_param("v", 2))
        .connect("start", "off")
        .connect("start", "on")
        .build();

    let result = Executor::new(wf).execute("wf-disabled", json!({})).await.unwrap();
    assert!(result.success);
    assert!(logs_for(&result, "off").is_empty());
    assert_eq!(logs_for(&result, "on").len(), 1);
}

#[tokio::test]
async fn serde_round_trip_preserves_execution_trace() {
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("loopA", BlockKind::Loop))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("i", "<loop.index>"))
        .add_block(Block::new("respC", BlockKind::Response).with_param("last", "<funcB.i>"))
        .connect("start", "loopA")
        .connect_handle("loopA", "funcB", "loop-start-source")
        .connect_handle("loopA", "respC", "loop-end-source")
        .add_loop(LoopConfig::for_count("loopA", vec!["funcB".into()], 2))
        .build();

    let restored: Workflow =
        serde_json::from_str(&serde_json::to_string(&wf).unwrap()).unwrap();

    let first = Executor::new(wf).execute("wf-rt", json!({})).await.unwrap();
    let second = Executor::new(restored).execute("wf-rt", json!({})).await.unwrap();
    assert_eq!(first.success, second.success);
    assert_eq!(
        first.output.get("last"),
        second.output.get("last")
    );
    let ids = |r: &ExecutionResult| {
        r.logs
            .iter()
            .map(|l| l.block_id.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
}

#[tokio::test]
async fn options_bound_layer_concurrency() {
    // Width 4 fan-out with a concurrency bound of 1 still completes.
    let wf = Workflow::builder()
        .add_block(Block::new("start", BlockKind::Starter))
        .add_block(Block::new("p", BlockKind::Parallel))
        .add_block(Block::new("funcB", BlockKind::Function).with_param("k", "<parallel.index>"))
        .add_block(Block::new("resp", BlockKind::Response).with_param("agg", "<p.results>"))
        .connect("start", "p")
        .connect_handle("p", "funcB", "parallel-start-source")
        .connect_handle("p", "resp", "parallel-end-source")
        .add_parallel(ParallelConfig::fan_out("p", vec!["funcB".into()], 4))
        .build();

    let result = Executor::new(wf)
        .with_options(ExecutorOptions {
            max_layer_concurrency: 1,
            ..ExecutorOptions::default()
        })
        .execute("wf-bounded", json!({}))
        .await
        .unwrap();
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(
        result.output.get("agg"),
        Some(json!([{"k": 0}, {"k": 1}, {"k": 2}, {"k": 3}]))
    );
}
