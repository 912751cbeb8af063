//! Response handler: shapes the workflow's outward-facing result from resolved
//! params.

use async_trait::async_trait;
use serde_json::{Map, Value};

use flowrun_core::HandlerError;
use flowrun_core::handler::{BlockHandler, ExecutionOutcome, HandlerContext};
use flowrun_core::output::{NormalizedOutput, ResponseOutput};
use flowrun_core::workflow::{Block, BlockKind};

const DEFAULT_STATUS: u16 = 200;

/// Executes `response` blocks: `data` (any, default the remaining inputs) and
/// `status` (default 200).
pub struct ResponseBlockHandler;

#[async_trait]
impl BlockHandler for ResponseBlockHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Response
    }

    async fn execute(
        &self,
        _block: &Block,
        mut inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let status = inputs
            .remove("status")
            .and_then(|v| v.as_u64())
            .map(|s| s as u16)
            .unwrap_or(DEFAULT_STATUS);
        let data = match inputs.remove("data") {
            Some(data) => data,
            None => Value::Object(inputs),
        };
        Ok(ExecutionOutcome::Output(NormalizedOutput::Response(
            ResponseOutput { data, status },
        )))
    }
}
