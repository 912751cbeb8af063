//! Condition handler: evaluates an ordered list of rules and reports the id of
//! the first match as the block's decision. Close the list with an `always`
//! rule for else semantics.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use flowrun_core::handler::{BlockHandler, ExecutionOutcome, HandlerContext};
use flowrun_core::output::{ConditionOutput, NormalizedOutput};
use flowrun_core::workflow::{Block, BlockKind};
use flowrun_core::HandlerError;

use crate::rule::Rule;

#[derive(Debug, Clone, Deserialize)]
struct ConditionEntry {
    id: String,
    #[serde(flatten)]
    rule: Rule,
}

/// Evaluates `params.conditions` in order; the first matching entry's id
/// becomes `selectedConditionId`.
pub struct ConditionBlockHandler;

#[async_trait]
impl BlockHandler for ConditionBlockHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Condition
    }

    async fn execute(
        &self,
        block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let raw = inputs
            .get("conditions")
            .cloned()
            .ok_or_else(|| HandlerError::new("condition block has no conditions param"))?;
        let entries: Vec<ConditionEntry> = serde_json::from_value(raw)
            .map_err(|e| HandlerError::new(format!("invalid conditions: {e}")))?;
        if entries.is_empty() {
            return Err(HandlerError::new("condition block has an empty rule list"));
        }
        for entry in &entries {
            if entry.rule.matches() {
                debug!(block = %block.id, selected = %entry.id, "condition matched");
                return Ok(ExecutionOutcome::Output(NormalizedOutput::Condition(
                    ConditionOutput {
                        selected_condition_id: entry.id.clone(),
                        content: None,
                    },
                )));
            }
        }
        Err(HandlerError::new(format!(
            "no condition matched in block {}",
            block.id
        )))
    }
}
