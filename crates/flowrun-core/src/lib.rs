//! # flowrun-core
//!
//! An in-process workflow execution engine. A workflow is a directed graph of
//! typed blocks (agent, function, api, router, condition, loop, parallel,
//! response, ...) connected by typed edges. The executor drives it to
//! completion in topologically valid layers, honouring routing decisions,
//! loop and parallel iteration semantics, error paths, and streaming of
//! partial results.
//!
//! Domain handlers (LLM calls, HTTP requests, code execution) are external:
//! they implement [`handler::BlockHandler`] and register with the executor.
//! Loop, parallel, and embedded-workflow blocks are runtime-handled.

pub mod context;
pub mod error;
pub mod executor;
pub mod handler;
pub mod loops;
pub mod observability;
pub mod output;
pub mod parallels;
pub mod path;
pub mod resolver;
pub mod routing;
pub mod streaming;
pub mod workflow;

pub use context::{BlockLog, BlockState, CancelHandle, EffectiveId, ExecutionContext};
pub use error::{ExecutionError, HandlerError, ValidationError};
pub use executor::{
    DebugSession, ExecutionMetadata, ExecutionResult, Executor, ExecutorOptions, MAX_ITERATIONS,
    StepReport,
};
pub use handler::{
    BlockHandler, ExecutionOutcome, GenericBlockHandler, HandlerContext, HandlerRegistry,
};
pub use observability::{LogFormat, LogOptions, init_logging};
pub use output::NormalizedOutput;
pub use streaming::{StreamEvent, StreamOptions, StreamingExecution, TokenStream};
pub use workflow::{
    Block, BlockConfig, BlockKind, Connection, Distribution, Handle, LoopConfig, LoopType,
    ParallelConfig, ParamType, Workflow, WorkflowBuilder,
};
