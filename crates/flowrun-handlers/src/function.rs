//! Function handler: renders `params.template` over the block's resolved
//! inputs through an injected [`TemplateRenderer`]. Without a template the
//! inputs pass through as the result.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use flowrun_core::HandlerError;
use flowrun_core::handler::{BlockHandler, ExecutionOutcome, HandlerContext};
use flowrun_core::output::{FunctionOutput, NormalizedOutput};
use flowrun_core::workflow::{Block, BlockKind};

/// Error from template rendering.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TemplateError(pub String);

/// Template renderer abstraction. Implement and pass when constructing the
/// handler.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, data: &Value) -> Result<String, TemplateError>;
}

/// Default renderer backed by handlebars in strict-off mode.
pub struct HandlebarsRenderer {
    registry: handlebars::Handlebars<'static>,
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self {
            registry: handlebars::Handlebars::new(),
        }
    }
}

impl TemplateRenderer for HandlebarsRenderer {
    fn render(&self, template: &str, data: &Value) -> Result<String, TemplateError> {
        self.registry
            .render_template(template, data)
            .map_err(|e| TemplateError(e.to_string()))
    }
}

/// Executes `function` blocks. With `params.template` the inputs are the
/// template data and the rendered text is the result (parsed as JSON when
/// `params.parseJson` is true); otherwise the inputs pass through.
pub struct FunctionBlockHandler {
    renderer: Arc<dyn TemplateRenderer>,
}

impl FunctionBlockHandler {
    pub fn new(renderer: Arc<dyn TemplateRenderer>) -> Self {
        Self { renderer }
    }
}

impl Default for FunctionBlockHandler {
    fn default() -> Self {
        Self::new(Arc::new(HandlebarsRenderer::default()))
    }
}

#[async_trait]
impl BlockHandler for FunctionBlockHandler {
    fn can_handle(&self, block: &Block) -> bool {
        block.kind == BlockKind::Function
    }

    async fn execute(
        &self,
        _block: &Block,
        inputs: Map<String, Value>,
        _ctx: &HandlerContext,
    ) -> Result<ExecutionOutcome, HandlerError> {
        let template = inputs.get("template").and_then(Value::as_str);
        let result = match template {
            Some(template) => {
                let mut data = inputs.clone();
                data.remove("template");
                let rendered = self
                    .renderer
                    .render(template, &Value::Object(data))
                    .map_err(|e| HandlerError::new(e.0))?;
                let parse_json = inputs
                    .get("parseJson")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if parse_json {
                    serde_json::from_str(&rendered)
                        .map_err(|e| HandlerError::new(format!("result is not valid JSON: {e}")))?
                } else {
                    Value::String(rendered)
                }
            }
            None => {
                let mut data = inputs.clone();
                data.remove("parseJson");
                Value::Object(data)
            }
        };
        Ok(ExecutionOutcome::Output(NormalizedOutput::Function(
            FunctionOutput {
                result,
                stdout: None,
            },
        )))
    }
}
