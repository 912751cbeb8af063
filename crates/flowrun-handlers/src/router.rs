//! Router handler: picks one downstream target from `params.routes`. A route
//! with a `when` rule matches conditionally; a route without one is the
//! default. The engine folds the decision into the active path.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use flowrun_core::HandlerError;
use flowrun_core::handler::{BlockHandler, ExecutionOutcome, HandlerContext};
use flowrun_core::output::{NormalizedOutput, RouterOutput};
use flowrun_core::workflow::{Block, BlockKind};

use crate::rule::Rule;

#[derive(Debug, Clone, Deserialize)]
struct Route {
    target: String,
    #[serde(default)]
    when: Option<Rule>,
}

/// Evaluates `params.routes` in order; the first route whose `when` rule
/// matches (or the first without one) becomes `selectedPath`.
pub struct RouterBlockHandler;

#[async_trait]
impl BlockHandler for RouterBlockHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Router
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let raw = inputs
            .get("routes")
            .cloned()
            .ok_or_else(|| HandlerError::new("router block has no routes param"))?;
        let routes: Vec<Route> = serde_json::from_value(raw)
            .map_err(|e| HandlerError::new(format!("invalid routes: {e}")))?;
        for route in &routes {
            let matched = match &route.when {
                Some(rule) => rule.matches(),
                None => true,
            };
            if matched {
                debug!(block = %block.id, target = %route.target, "route selected");
                return Ok(ExecutionOutcome::Output(NormalizedOutput::Router(
                    RouterOutput {
                        selected_path: route.target.clone(),
                        content: None,
                    },
                )));
            }
        }
        Err(HandlerError::new(format!(
            "no route matched in block {}",
            block.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn selected(routes: Value) -> Result<String, HandlerError> {
        let block = Block::new("r", BlockKind::Router);
        let mut inputs = Map::new();
        inputs.insert("routes".to_string(), routes);
        let out = RouterBlockHandler
            .execute(&block, inputs, &HandlerContext::standalone("wf", "r"))
            .await?;
        match out {
            ExecutionOutcome::Output(NormalizedOutput::Router(r)) => Ok(r.selected_path),
            _ => panic!("expected router output"),
        }
    }

    #[tokio::test]
    async fn conditional_route_wins_over_default() {
        let target = selected(json!([
            {"target": "b", "when": {"left": "urgent", "operator": "equals", "right": "urgent"}},
            {"target": "c"}
        ]))
        .await
        .unwrap();
        assert_eq!(target, "b");
    }

    #[tokio::test]
    async fn falls_back_to_default_route() {
        let target = selected(json!([
            {"target": "b", "when": {"left": "calm", "operator": "equals", "right": "urgent"}},
            {"target": "c"}
        ]))
        .await
        .unwrap();
        assert_eq!(target, "c");
    }

    #[tokio::test]
    async fn no_route_is_an_error() {
        let err = selected(json!([
            {"target": "b", "when": {"left": 1, "operator": "equals", "right": 2}}
        ]))
        .await
        .unwrap_err();
        assert!(err.message.contains("no route matched"));
    }
}
