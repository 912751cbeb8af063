//! Workflow document: typed blocks, connections with handles, loop and parallel configs.
//! Immutable per execution; the editor that produces it lives elsewhere.

mod builder;
mod validate;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use builder::WorkflowBuilder;

/// Block kind. Drives routing taxonomy, handler dispatch, and flow-control ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Starter,
    Agent,
    Function,
    Api,
    Router,
    Condition,
    Loop,
    Parallel,
    Evaluator,
    Response,
    Workflow,
    Generic,
}

impl BlockKind {
    /// Human label used in logs and error messages.
    pub fn label(self) -> &'static str {
        match self {
            BlockKind::Starter => "starter",
            BlockKind::Agent => "agent",
            BlockKind::Function => "function",
            BlockKind::Api => "api",
            BlockKind::Router => "router",
            BlockKind::Condition => "condition",
            BlockKind::Loop => "loop",
            BlockKind::Parallel => "parallel",
            BlockKind::Evaluator => "evaluator",
            BlockKind::Response => "response",
            BlockKind::Workflow => "workflow",
            BlockKind::Generic => "generic",
        }
    }
}

/// Display coordinates. Carried through serialization, ignored by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Declared parameter type, driving input coercion after reference resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

/// Per-block configuration: the tool the block drives plus its raw parameters.
/// `param_types` declares coercion targets for params that arrive as strings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BlockConfig {
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub param_types: HashMap<String, ParamType>,
}

/// A typed node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BlockKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub config: BlockConfig,
}

fn default_enabled() -> bool {
    true
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            enabled: true,
            position: Position::default(),
            config: BlockConfig::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.config.tool = tool.into();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.params.insert(key.into(), value.into());
        self
    }

    pub fn with_param_type(mut self, key: impl Into<String>, ty: ParamType) -> Self {
        self.config.param_types.insert(key.into(), ty);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Display name falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.config.params.get(key)
    }
}

/// Parsed source handle of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Handle {
    /// Normal value edge (absent or `"source"`).
    Source,
    /// Taken only when the source block's state carries an error.
    Error,
    /// `condition-<id>`: taken when the condition block selected `<id>`.
    Condition(String),
    /// Entered on every loop iteration start.
    LoopStart,
    /// Taken once the loop has latched completion.
    LoopEnd,
    ParallelStart,
    ParallelEnd,
}

impl Handle {
    /// Unrecognised handle values fall back to `Source`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("source") => Handle::Source,
            Some("error") => Handle::Error,
            Some("loop-start-source") => Handle::LoopStart,
            Some("loop-end-source") => Handle::LoopEnd,
            Some("parallel-start-source") => Handle::ParallelStart,
            Some("parallel-end-source") => Handle::ParallelEnd,
            Some(other) => match other.strip_prefix("condition-") {
                Some(id) => Handle::Condition(id.to_string()),
                None => Handle::Source,
            },
        }
    }
}

/// A typed edge between two blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub target: String,
    #[serde(
        default,
        rename = "sourceHandle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
}

impl Connection {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn handle(&self) -> Handle {
        Handle::parse(self.source_handle.as_deref())
    }
}

/// Loop iteration style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopType {
    #[serde(rename = "for")]
    For,
    #[serde(rename = "forEach")]
    ForEach,
}

impl Default for LoopType {
    fn default() -> Self {
        LoopType::For
    }
}

/// Configuration of one loop construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub id: String,
    /// Blocks iterated by this loop. Every id must exist in the workflow.
    pub nodes: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default, rename = "loopType")]
    pub loop_type: LoopType,
    /// For `forEach`: a literal sequence, a mapping, or an expression string
    /// resolved at loop entry.
    #[serde(
        default,
        rename = "forEachItems",
        skip_serializing_if = "Option::is_none"
    )]
    pub for_each_items: Option<Value>,
}

fn default_iterations() -> u32 {
    1
}

impl LoopConfig {
    pub fn for_count(id: impl Into<String>, nodes: Vec<String>, iterations: u32) -> Self {
        Self {
            id: id.into(),
            nodes,
            iterations,
            loop_type: LoopType::For,
            for_each_items: None,
        }
    }

    pub fn for_each(id: impl Into<String>, nodes: Vec<String>, items: Value) -> Self {
        Self {
            id: id.into(),
            nodes,
            iterations: 1,
            loop_type: LoopType::ForEach,
            for_each_items: Some(items),
        }
    }
}

/// Fan-out width of a parallel: a fixed count or one virtual instance per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Distribution {
    Count(u32),
    Items(Value),
}

impl Distribution {
    pub fn count(&self) -> usize {
        match self {
            Distribution::Count(n) => *n as usize,
            Distribution::Items(Value::Array(items)) => items.len(),
            Distribution::Items(Value::Object(map)) => map.len(),
            Distribution::Items(_) => 0,
        }
    }

    /// Item bound to iteration `index`. Mappings iterate as `[key, value]` pairs
    /// in key order; a plain count carries no items.
    pub fn item(&self, index: usize) -> Option<Value> {
        match self {
            Distribution::Count(_) => None,
            Distribution::Items(Value::Array(items)) => items.get(index).cloned(),
            Distribution::Items(Value::Object(map)) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                keys.get(index)
                    .map(|k| Value::Array(vec![Value::String((*k).clone()), map[*k].clone()]))
            }
            Distribution::Items(_) => None,
        }
    }
}

/// Configuration of one parallel construct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub id: String,
    pub nodes: Vec<String>,
    pub distribution: Distribution,
}

impl ParallelConfig {
    pub fn fan_out(id: impl Into<String>, nodes: Vec<String>, count: u32) -> Self {
        Self {
            id: id.into(),
            nodes,
            distribution: Distribution::Count(count),
        }
    }

    pub fn over_items(id: impl Into<String>, nodes: Vec<String>, items: Value) -> Self {
        Self {
            id: id.into(),
            nodes,
            distribution: Distribution::Items(items),
        }
    }
}

/// The workflow document handed to the executor. Immutable per execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "default_version")]
    pub version: String,
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub loops: HashMap<String, LoopConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parallels: HashMap<String, ParallelConfig>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Workflow {
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// The unique starter block, if present.
    pub fn starter(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.kind == BlockKind::Starter)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.target == id)
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Connection> {
        self.connections.iter().filter(move |c| c.source == id)
    }

    /// The loop whose `nodes` list contains `id`.
    pub fn loop_containing(&self, id: &str) -> Option<&LoopConfig> {
        self.loops.values().find(|l| l.nodes.iter().any(|n| n == id))
    }

    /// The parallel whose `nodes` list contains `id`.
    pub fn parallel_containing(&self, id: &str) -> Option<&ParallelConfig> {
        self.parallels
            .values()
            .find(|p| p.nodes.iter().any(|n| n == id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handle_parse_recognised_values() {
        assert_eq!(Handle::parse(None), Handle::Source);
        assert_eq!(Handle::parse(Some("source")), Handle::Source);
        assert_eq!(Handle::parse(Some("error")), Handle::Error);
        assert_eq!(
            Handle::parse(Some("condition-c1")),
            Handle::Condition("c1".to_string())
        );
        assert_eq!(Handle::parse(Some("loop-start-source")), Handle::LoopStart);
        assert_eq!(Handle::parse(Some("loop-end-source")), Handle::LoopEnd);
        assert_eq!(
            Handle::parse(Some("parallel-start-source")),
            Handle::ParallelStart
        );
        assert_eq!(
            Handle::parse(Some("parallel-end-source")),
            Handle::ParallelEnd
        );
        assert_eq!(Handle::parse(Some("mystery")), Handle::Source);
    }

    #[test]
    fn distribution_count_and_items() {
        assert_eq!(Distribution::Count(3).count(), 3);
        let d = Distribution::Items(json!(["a", "b"]));
        assert_eq!(d.count(), 2);
        assert_eq!(d.item(1), Some(json!("b")));
        assert_eq!(d.item(2), None);
        let d = Distribution::Items(json!({"b": 2, "a": 1}));
        assert_eq!(d.count(), 2);
        assert_eq!(d.item(0), Some(json!(["a", 1])));
        assert_eq!(d.item(1), Some(json!(["b", 2])));
    }

    #[test]
    fn workflow_serde_roundtrip() {
        let wf = Workflow::builder()
            .add_block(Block::new("start", BlockKind::Starter))
            .add_block(
                Block::new("fn1", BlockKind::Function)
                    .with_name("Transform")
                    .with_param("template", "{{x}}"),
            )
            .connect("start", "fn1")
            .add_loop(LoopConfig::for_count("loop1", vec!["fn1".into()], 3))
            .build();
        let json = serde_json::to_string(&wf).unwrap();
        let restored: Workflow = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, wf);
        assert_eq!(restored.loops["loop1"].iterations, 3);
    }

    #[test]
    fn containing_lookups() {
        let wf = Workflow::builder()
            .add_block(Block::new("start", BlockKind::Starter))
            .add_block(Block::new("a", BlockKind::Function))
            .add_block(Block::new("b", BlockKind::Function))
            .add_loop(LoopConfig::for_count("l", vec!["a".into()], 2))
            .add_parallel(ParallelConfig::fan_out("p", vec!["b".into()], 2))
            .build();
        assert_eq!(wf.loop_containing("a").map(|l| l.id.as_str()), Some("l"));
        assert!(wf.loop_containing("b").is_none());
        assert_eq!(
            wf.parallel_containing("b").map(|p| p.id.as_str()),
            Some("p")
        );
    }

    #[test]
    fn connection_handle_survives_serde() {
        let c = Connection::new("a", "b").with_handle("condition-else");
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("sourceHandle"));
        let restored: Connection = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.handle(), Handle::Condition("else".to_string()));
    }
}
