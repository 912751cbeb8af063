//! Normalized block outputs: a tagged union of the known output shapes plus an
//! opaque mapping for generic handlers. Reference resolution walks fields by
//! name through [`NormalizedOutput::get`]; the JSON form produced by
//! [`NormalizedOutput::to_value`] is what logs and references observe.

use std::collections::HashMap;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

/// Token accounting reported by agent handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AgentOutput {
    pub content: String,
    pub model: Option<String>,
    pub tokens: Option<TokenUsage>,
    pub tool_calls: Vec<Value>,
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionOutput {
    pub result: Value,
    pub stdout: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiOutput {
    pub data: Value,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// A router's decision: the chosen target block id.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterOutput {
    pub selected_path: String,
    pub content: Option<String>,
}

/// A condition block's decision: the id of the matched condition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutput {
    pub selected_condition_id: String,
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluatorOutput {
    pub content: String,
    pub scores: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseOutput {
    pub data: Value,
    pub status: u16,
}

/// Progress marker published by loop and parallel blocks while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlOutput {
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub completed: bool,
}

/// Aggregated result of a completed parallel: one entry per iteration, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateOutput {
    pub results: Vec<Value>,
    pub count: usize,
}

/// Failure state of a block. `error` + `status` is the failure convention
/// throughout the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorOutput {
    pub error: String,
    pub status: u16,
}

/// The normalized output stored in a block's state.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedOutput {
    Agent(AgentOutput),
    Function(FunctionOutput),
    Api(ApiOutput),
    Router(RouterOutput),
    Condition(ConditionOutput),
    Evaluator(EvaluatorOutput),
    Response(ResponseOutput),
    FlowControl(FlowControlOutput),
    Aggregate(AggregateOutput),
    Error(ErrorOutput),
    Opaque(Map<String, Value>),
}

impl Default for NormalizedOutput {
    fn default() -> Self {
        NormalizedOutput::Opaque(Map::new())
    }
}

impl NormalizedOutput {
    pub fn opaque(map: Map<String, Value>) -> Self {
        NormalizedOutput::Opaque(map)
    }

    pub fn error(message: impl Into<String>, status: u16) -> Self {
        NormalizedOutput::Error(ErrorOutput {
            error: message.into(),
            status,
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, NormalizedOutput::Error(_))
    }

    pub fn as_error(&self) -> Option<&ErrorOutput> {
        match self {
            NormalizedOutput::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Classify a raw JSON value. Objects carrying the `error` convention become
    /// [`ErrorOutput`]; other objects stay opaque; scalars are wrapped under
    /// `result`.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                if let Some(Value::String(error)) = map.get("error") {
                    let status = map
                        .get("status")
                        .and_then(Value::as_u64)
                        .map(|s| s as u16)
                        .unwrap_or(500);
                    return NormalizedOutput::Error(ErrorOutput {
                        error: error.clone(),
                        status,
                    });
                }
                NormalizedOutput::Opaque(map)
            }
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                NormalizedOutput::Opaque(map)
            }
        }
    }

    /// Top-level field accessor used by reference resolution. Field names match
    /// the JSON form (`content`, `result`, `data`, `selectedPath`, ...).
    pub fn get(&self, field: &str) -> Option<Value> {
        match self {
            NormalizedOutput::Agent(o) => match field {
                "content" => Some(Value::String(o.content.clone())),
                "model" => o.model.clone().map(Value::String),
                "tokens" => o.tokens.map(|t| {
                    json!({ "prompt": t.prompt, "completion": t.completion, "total": t.total })
                }),
                "toolCalls" => Some(Value::Array(o.tool_calls.clone())),
                "cost" => o.cost.map(|c| json!(c)),
                _ => None,
            },
            NormalizedOutput::Function(o) => match field {
                "result" => Some(o.result.clone()),
                "stdout" => o.stdout.clone().map(Value::String),
                _ => None,
            },
            NormalizedOutput::Api(o) => match field {
                "data" => Some(o.data.clone()),
                "status" => Some(json!(o.status)),
                "headers" => Some(json!(o.headers)),
                _ => None,
            },
            NormalizedOutput::Router(o) => match field {
                "selectedPath" => Some(Value::String(o.selected_path.clone())),
                "content" => o.content.clone().map(Value::String),
                _ => None,
            },
            NormalizedOutput::Condition(o) => match field {
                "selectedConditionId" => Some(Value::String(o.selected_condition_id.clone())),
                "content" => o.content.clone().map(Value::String),
                _ => None,
            },
            NormalizedOutput::Evaluator(o) => match field {
                "content" => Some(Value::String(o.content.clone())),
                "scores" => Some(Value::Object(o.scores.clone())),
                other => o.scores.get(other).cloned(),
            },
            NormalizedOutput::Response(o) => match field {
                "data" => Some(o.data.clone()),
                "status" => Some(json!(o.status)),
                _ => None,
            },
            NormalizedOutput::FlowControl(o) => match field {
                "currentIteration" => Some(json!(o.current_iteration)),
                "maxIterations" => Some(json!(o.max_iterations)),
                "completed" => Some(Value::Bool(o.completed)),
                _ => None,
            },
            NormalizedOutput::Aggregate(o) => match field {
                "results" => Some(Value::Array(o.results.clone())),
                "count" => Some(json!(o.count)),
                _ => None,
            },
            NormalizedOutput::Error(o) => match field {
                "error" => Some(Value::String(o.error.clone())),
                "status" => Some(json!(o.status)),
                _ => None,
            },
            NormalizedOutput::Opaque(map) => map.get(field).cloned(),
        }
    }

    /// The JSON form recorded in logs and exposed to references.
    pub fn to_value(&self) -> Value {
        match self {
            NormalizedOutput::Agent(o) => {
                let mut map = Map::new();
                map.insert("content".to_string(), Value::String(o.content.clone()));
                if let Some(model) = &o.model {
                    map.insert("model".to_string(), Value::String(model.clone()));
                }
                if let Some(t) = o.tokens {
                    map.insert(
                        "tokens".to_string(),
                        json!({ "prompt": t.prompt, "completion": t.completion, "total": t.total }),
                    );
                }
                if !o.tool_calls.is_empty() {
                    map.insert("toolCalls".to_string(), Value::Array(o.tool_calls.clone()));
                }
                if let Some(cost) = o.cost {
                    map.insert("cost".to_string(), json!(cost));
                }
                Value::Object(map)
            }
            NormalizedOutput::Function(o) => {
                let mut map = Map::new();
                map.insert("result".to_string(), o.result.clone());
                if let Some(stdout) = &o.stdout {
                    map.insert("stdout".to_string(), Value::String(stdout.clone()));
                }
                Value::Object(map)
            }
            NormalizedOutput::Api(o) => json!({
                "data": o.data,
                "status": o.status,
                "headers": o.headers,
            }),
            NormalizedOutput::Router(o) => {
                let mut map = Map::new();
                map.insert(
                    "selectedPath".to_string(),
                    Value::String(o.selected_path.clone()),
                );
                if let Some(content) = &o.content {
                    map.insert("content".to_string(), Value::String(content.clone()));
                }
                Value::Object(map)
            }
            NormalizedOutput::Condition(o) => {
                let mut map = Map::new();
                map.insert(
                    "selectedConditionId".to_string(),
                    Value::String(o.selected_condition_id.clone()),
                );
                if let Some(content) = &o.content {
                    map.insert("content".to_string(), Value::String(content.clone()));
                }
                Value::Object(map)
            }
            NormalizedOutput::Evaluator(o) => {
                let mut map = o.scores.clone();
                map.insert("content".to_string(), Value::String(o.content.clone()));
                Value::Object(map)
            }
            NormalizedOutput::Response(o) => json!({ "data": o.data, "status": o.status }),
            NormalizedOutput::FlowControl(o) => json!({
                "currentIteration": o.current_iteration,
                "maxIterations": o.max_iterations,
                "completed": o.completed,
            }),
            NormalizedOutput::Aggregate(o) => json!({
                "results": o.results,
                "count": o.count,
            }),
            NormalizedOutput::Error(o) => json!({ "error": o.error, "status": o.status }),
            NormalizedOutput::Opaque(map) => Value::Object(map.clone()),
        }
    }
}

impl Serialize for NormalizedOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification_from_value() {
        let out = NormalizedOutput::from_value(json!({"error": "boom", "status": 502}));
        let e = out.as_error().unwrap();
        assert_eq!(e.error, "boom");
        assert_eq!(e.status, 502);

        let out = NormalizedOutput::from_value(json!({"data": 1}));
        assert!(!out.is_error());

        let out = NormalizedOutput::from_value(json!("plain"));
        assert_eq!(out.get("result"), Some(json!("plain")));
    }

    #[test]
    fn accessor_matches_json_form() {
        let out = NormalizedOutput::Agent(AgentOutput {
            content: "hello".to_string(),
            model: Some("m1".to_string()),
            tokens: Some(TokenUsage {
                prompt: 10,
                completion: 5,
                total: 15,
            }),
            tool_calls: vec![],
            cost: None,
        });
        assert_eq!(out.get("content"), Some(json!("hello")));
        assert_eq!(out.get("model"), Some(json!("m1")));
        assert_eq!(out.get("tokens").unwrap()["total"], json!(15));
        assert_eq!(out.get("missing"), None);

        let value = out.to_value();
        assert_eq!(value["content"], json!("hello"));
        assert_eq!(value["tokens"]["prompt"], json!(10));
    }

    #[test]
    fn router_and_condition_decisions_visible() {
        let r = NormalizedOutput::Router(RouterOutput {
            selected_path: "b2".to_string(),
            content: None,
        });
        assert_eq!(r.get("selectedPath"), Some(json!("b2")));

        let c = NormalizedOutput::Condition(ConditionOutput {
            selected_condition_id: "else".to_string(),
            content: Some("fallthrough".to_string()),
        });
        assert_eq!(c.get("selectedConditionId"), Some(json!("else")));
        assert_eq!(c.to_value()["content"], json!("fallthrough"));
    }

    #[test]
    fn aggregate_shape() {
        let a = NormalizedOutput::Aggregate(AggregateOutput {
            results: vec![json!({"k": 0}), json!({"k": 1})],
            count: 2,
        });
        assert_eq!(a.get("count"), Some(json!(2)));
        assert_eq!(a.to_value()["results"][1]["k"], json!(1));
    }
}
