//! The handler contract: the engine's only extensibility surface. A handler
//! declares which blocks it can execute and runs them against resolved inputs
//! and a read-only context snapshot. Loop, parallel, and embedded-workflow
//! blocks are runtime-handled and never reach the registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::CancelHandle;
use crate::error::HandlerError;
use crate::output::NormalizedOutput;
use crate::streaming::StreamingExecution;
use crate::workflow::Block;

/// Iteration scope visible to handlers running inside a loop.
#[derive(Debug, Clone, Default)]
pub struct LoopScope {
    pub index: usize,
    pub item: Option<Value>,
    pub items: Option<Value>,
}

/// Iteration scope visible to handlers running inside a parallel.
#[derive(Debug, Clone, Default)]
pub struct ParallelScope {
    pub index: usize,
    pub item: Option<Value>,
}

/// Read-only snapshot handed to a handler. Handlers may read ambient data and
/// iteration scopes; the engine's state maps are not reachable from here.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub workflow_id: String,
    pub execution_id: Uuid,
    /// Effective id of the executing block (virtual form inside parallels).
    pub block_id: String,
    pub environment: Arc<HashMap<String, String>>,
    pub variables: Arc<HashMap<String, Value>>,
    pub loop_scope: Option<LoopScope>,
    pub parallel_scope: Option<ParallelScope>,
    pub cancel: CancelHandle,
}

impl HandlerContext {
    /// Minimal context for invoking a handler outside an execution (tests,
    /// standalone tooling). No iteration scopes, empty ambient data.
    pub fn standalone(workflow_id: impl Into<String>, block_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4(),
            block_id: block_id.into(),
            environment: Arc::new(HashMap::new()),
            variables: Arc::new(HashMap::new()),
            loop_scope: None,
            parallel_scope: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn env(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

/// What a handler produced: a final output, or a token stream to be teed and
/// finalised by the engine.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Output(NormalizedOutput),
    Streaming(StreamingExecution),
}

impl From<NormalizedOutput> for ExecutionOutcome {
    fn from(output: NormalizedOutput) -> Self {
        ExecutionOutcome::Output(output)
    }
}

/// A block handler. `can_handle` is consulted in registration order; the first
/// match executes the block.
#[async_trait]
pub trait BlockHandler: Send + Sync {
    fn can_handle(&self, block: &Block) -> bool;

    async fn execute(
        &self,
        block: &Block,
        inputs: Map<String, Value>,
        ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError>;
}

/// Last-resort handler: echoes the resolved inputs as an opaque output.
pub struct GenericBlockHandler;

#[async_trait]
impl BlockHandler for GenericBlockHandler {
    fn can_handle(&self, _block: &Block) -> bool {
        true
    }

    async fn execute(
        &self,
        _block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        Ok(ExecutionOutcome::Output(NormalizedOutput::Opaque(inputs)))
    }
}

/// Registry of handlers, dispatched first-match with a generic fallback.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn BlockHandler>>,
    fallback: Arc<dyn BlockHandler>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            fallback: Arc::new(GenericBlockHandler),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn BlockHandler>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    /// The handler that will execute `block`. Always resolves; the generic
    /// handler is the last resort.
    pub fn resolve(&self, block: &Block) -> Arc<dyn BlockHandler> {
        self.handlers
            .iter()
            .find(|h| h.can_handle(block))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::BlockKind;
    use serde_json::json;

    struct OnlyAgents;

    #[async_trait]
    impl BlockHandler for OnlyAgents {
        fn can_handle(&self, block: &Block) -> bool {
            block.kind == BlockKind::Agent
        }

        async fn execute(
            &self,
            _block: &Block,
            _inputs: Map<String, Value>,
            _ctx: &HandlerContext,
        ) -> Result<ExecutionOutcome, HandlerError> {
            Ok(NormalizedOutput::from_value(json!({"handled": "agent"})).into())
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            workflow_id: "wf".to_string(),
            execution_id: Uuid::new_v4(),
            block_id: "b".to_string(),
            environment: Arc::new(HashMap::new()),
            variables: Arc::new(HashMap::new()),
            loop_scope: None,
            parallel_scope: None,
            cancel: CancelHandle::new(),
        }
    }

    #[tokio::test]
    async fn registry_dispatches_first_match() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(OnlyAgents));
        let agent = Block::new("a", BlockKind::Agent);
        let handler = registry.resolve(&agent);
        let out = handler.execute(&agent, Map::new(), &ctx()).await.unwrap();
        match out {
            ExecutionOutcome::Output(o) => assert_eq!(o.get("handled"), Some(json!("agent"))),
            ExecutionOutcome::Streaming(_) => panic!("expected output"),
        }
    }

    #[tokio::test]
    async fn generic_fallback_echoes_inputs() {
        let registry = HandlerRegistry::new();
        let block = Block::new("g", BlockKind::Generic);
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(42));
        let out = registry
            .resolve(&block)
            .execute(&block, inputs, &ctx())
            .await
            .unwrap();
        match out {
            ExecutionOutcome::Output(o) => assert_eq!(o.get("x"), Some(json!(42))),
            ExecutionOutcome::Streaming(_) => panic!("expected output"),
        }
    }
}
