//! # flowrun-handlers
//!
//! Reference block handlers for the flowrun engine: `condition`, `router`,
//! `api`, `function`, and `response`. Each handler keeps its I/O seam behind
//! an injected collaborator trait (`HttpRequester`, `TemplateRenderer`) with a
//! working default, so they run out of the box and swap cleanly in tests.
//!
//! `agent` and `evaluator` handlers wrap LLM providers and live outside this
//! crate; register your own implementations alongside these.

pub mod api;
pub mod condition;
pub mod function;
pub mod response;
pub mod router;
pub mod rule;

use std::sync::Arc;

use flowrun_core::HandlerRegistry;

pub use api::{ApiBlockHandler, HttpRequest, HttpRequestError, HttpRequester, HttpResponse, ReqwestRequester};
pub use condition::ConditionBlockHandler;
pub use function::{FunctionBlockHandler, HandlebarsRenderer, TemplateError, TemplateRenderer};
pub use response::ResponseBlockHandler;
pub use router::RouterBlockHandler;
pub use rule::{Operator, Rule};

/// Register every reference handler with its default collaborators.
pub fn register_reference_handlers(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(ConditionBlockHandler));
    registry.register(Arc::new(RouterBlockHandler));
    registry.register(Arc::new(ApiBlockHandler::default()));
    registry.register(Arc::new(FunctionBlockHandler::default()));
    registry.register(Arc::new(ResponseBlockHandler));
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowrun_core::workflow::{Block, BlockKind};

    #[test]
    fn registry_resolves_each_reference_handler() {
        let mut registry = HandlerRegistry::new();
        register_reference_handlers(&mut registry);
        for kind in [
            BlockKind::Condition,
            BlockKind::Router,
            BlockKind::Api,
            BlockKind::Function,
            BlockKind::Response,
        ] {
            let block = Block::new("b", kind);
            // The fallback also answers true, so resolution always succeeds;
            // this asserts the call path stays panic-free per kind.
            let _ = registry.resolve(&block);
        }
    }
}
