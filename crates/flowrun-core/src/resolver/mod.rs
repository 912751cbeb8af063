//! Input resolution: a block's declared params are resolved against upstream
//! block outputs, workflow variables, environment variables, and the iteration
//! context, then coerced to the block's declared param types. Resolution is
//! pure with respect to the context at call time.

mod accessible;
mod reference;

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

pub use accessible::{accessible_map, name_index, normalize};
pub use reference::{PathSeg, RefSource, Reference, TemplatePart, parse_reference, parse_template, walk_path};

use crate::context::{EffectiveId, ExecutionContext};
use crate::error::ExecutionError;
use crate::workflow::{Block, BlockKind, ParamType, Workflow};

/// Per-workflow resolver. Accessible sets and the name index are precomputed
/// once and reused across every block resolution in the run.
pub struct InputResolver<'w> {
    workflow: &'w Workflow,
    accessible: HashMap<String, HashSet<String>>,
    names: HashMap<String, String>,
}

impl<'w> InputResolver<'w> {
    pub fn new(workflow: &'w Workflow) -> Self {
        Self {
            workflow,
            accessible: accessible_map(workflow),
            names: name_index(workflow),
        }
    }

    /// Resolve every param of `block`. The `workflow` param of embedded
    /// workflow blocks is engine-consumed raw and passes through untouched.
    pub fn resolve_inputs(
        &self,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, ExecutionError> {
        let mut resolved = Map::new();
        for (key, value) in &block.config.params {
            if block.kind == BlockKind::Workflow && key == "workflow" {
                resolved.insert(key.clone(), value.clone());
                continue;
            }
            let mut v = self.resolve_value(value, block, ctx)?;
            if let Some(declared) = block.config.param_types.get(key) {
                v = coerce_param(key, v, *declared)?;
            }
            resolved.insert(key.clone(), v);
        }
        Ok(resolved)
    }

    /// Resolve references inside one value, recursing through arrays and objects.
    pub fn resolve_value(
        &self,
        value: &Value,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        match value {
            Value::String(s) => self.resolve_string(s, block, ctx),
            Value::Array(items) => items
                .iter()
                .map(|v| self.resolve_value(v, block, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, block, ctx)?)))
                .collect::<Result<Map<_, _>, ExecutionError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve one string. A string that is exactly one reference yields the
    /// referenced value with its type intact; mixed templates concatenate, with
    /// non-string values rendered as JSON.
    pub fn resolve_string(
        &self,
        raw: &str,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let expanded = self.substitute_env(raw, ctx)?;
        let parts = parse_template(&expanded);
        match parts.as_slice() {
            [] => Ok(Value::String(String::new())),
            [TemplatePart::Ref(reference)] => self.resolve_reference(reference, block, ctx),
            _ => {
                let mut out = String::new();
                for part in &parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Ref(reference) => {
                            let value = self.resolve_reference(reference, block, ctx)?;
                            match value {
                                Value::String(s) => out.push_str(&s),
                                other => out.push_str(&other.to_string()),
                            }
                        }
                    }
                }
                Ok(Value::String(out))
            }
        }
    }

    /// Resolve a runtime expression (forEach items): a single reference or an
    /// inline JSON literal.
    pub fn resolve_expression(
        &self,
        expr: &str,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let trimmed = expr.trim();
        if let [TemplatePart::Ref(reference)] = parse_template(trimmed).as_slice() {
            return self.resolve_reference(reference, block, ctx);
        }
        serde_json::from_str(trimmed).map_err(|_| {
            ExecutionError::Reference(format!("cannot resolve expression: {trimmed}"))
        })
    }

    fn substitute_env(&self, raw: &str, ctx: &ExecutionContext) -> Result<String, ExecutionError> {
        if !raw.contains("{{") {
            return Ok(raw.to_string());
        }
        let mut out = String::new();
        let mut rest = raw;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let name = after[..close].trim();
                    // Only all-uppercase names are environment references;
                    // anything else (template placeholders, JSON braces) is
                    // left untouched.
                    let valid = name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
                        && name
                            .chars()
                            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
                    if valid {
                        match ctx.environment.get(name) {
                            Some(value) => out.push_str(value),
                            None => {
                                return Err(ExecutionError::Reference(format!(
                                    "environment variable {name} is not set"
                                )));
                            }
                        }
                    } else {
                        out.push_str("{{");
                        out.push_str(&after[..close]);
                        out.push_str("}}");
                    }
                    rest = &after[close + 2..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve_reference(
        &self,
        reference: &Reference,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        match &reference.source {
            RefSource::Start => {
                let starter = self
                    .workflow
                    .starter()
                    .ok_or_else(|| ExecutionError::Internal("no starter block".to_string()))?;
                let output = ctx.output(&EffectiveId::base(&starter.id)).ok_or_else(|| {
                    ExecutionError::Internal("starter state not seeded".to_string())
                })?;
                self.walk_output(&output.to_value(), &reference.path, &reference.raw)
            }
            RefSource::Loop => self.resolve_loop_scope(reference, block, ctx),
            RefSource::Parallel => self.resolve_parallel_scope(reference, block, ctx),
            RefSource::Variable(name) => {
                let value = ctx.variables.get(name).ok_or_else(|| {
                    ExecutionError::Reference(format!("workflow variable {name} is not defined"))
                })?;
                self.walk_output(value, &reference.path, &reference.raw)
            }
            RefSource::Block(name) => self.resolve_block_reference(name, reference, block, ctx),
        }
    }

    fn resolve_loop_scope(
        &self,
        reference: &Reference,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let containing = self.workflow.loop_containing(&block.id).ok_or_else(|| {
            ExecutionError::Reference(format!(
                "{} used outside a loop in block {}",
                reference.raw, block.id
            ))
        })?;
        let (head, rest) = split_scope_path(&reference.path, &reference.raw)?;
        let value = match head {
            "index" => {
                let counter = ctx.loop_iteration(&containing.id);
                Value::from(counter.saturating_sub(1))
            }
            "currentItem" => ctx.loop_item(&containing.id).cloned().ok_or_else(|| {
                ExecutionError::Reference(format!("{} has no current item", reference.raw))
            })?,
            "items" => ctx.loop_collection(&containing.id).cloned().ok_or_else(|| {
                ExecutionError::Reference(format!("{} has no item collection", reference.raw))
            })?,
            other => {
                return Err(ExecutionError::Reference(format!(
                    "unknown loop property: {other}"
                )));
            }
        };
        self.walk_output(&value, rest, &reference.raw)
    }

    fn resolve_parallel_scope(
        &self,
        reference: &Reference,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let instance = ctx
            .current_virtual
            .as_ref()
            .and_then(|v| v.parallel_instance())
            .ok_or_else(|| {
                ExecutionError::Reference(format!(
                    "{} used outside a parallel in block {}",
                    reference.raw, block.id
                ))
            })?;
        let (head, rest) = split_scope_path(&reference.path, &reference.raw)?;
        let value = match head {
            "index" => Value::from(instance.iteration),
            "currentItem" => self
                .workflow
                .parallels
                .get(&instance.parallel_id)
                .and_then(|p| p.distribution.item(instance.iteration))
                .ok_or_else(|| {
                    ExecutionError::Reference(format!("{} has no current item", reference.raw))
                })?,
            other => {
                return Err(ExecutionError::Reference(format!(
                    "unknown parallel property: {other}"
                )));
            }
        };
        self.walk_output(&value, rest, &reference.raw)
    }

    fn resolve_block_reference(
        &self,
        name: &str,
        reference: &Reference,
        block: &Block,
        ctx: &ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let target_id = if self.workflow.block(name).is_some() {
            name.to_string()
        } else {
            match self.names.get(&normalize(name)) {
                Some(id) => id.clone(),
                None => {
                    return Err(ExecutionError::Reference(format!(
                        "{} does not match any block",
                        reference.raw
                    )));
                }
            }
        };

        let allowed = self
            .accessible
            .get(&block.id)
            .is_some_and(|set| set.contains(&target_id));
        if !allowed {
            return Err(ExecutionError::Reference(format!(
                "block {} cannot reference {}: not an upstream block",
                block.id, target_id
            )));
        }

        // Inside a parallel, sibling lookups redirect to the same iteration's
        // virtual instance; blocks outside the parallel keep their single state.
        let effective = match ctx.current_virtual.as_ref().and_then(|v| v.parallel_instance()) {
            Some(instance)
                if self
                    .workflow
                    .parallels
                    .get(&instance.parallel_id)
                    .is_some_and(|p| p.nodes.iter().any(|n| *n == target_id)) =>
            {
                EffectiveId::instance(&target_id, &instance.parallel_id, instance.iteration)
            }
            _ => EffectiveId::base(&target_id),
        };

        let output = ctx.output(&effective).ok_or_else(|| {
            ExecutionError::Reference(format!(
                "{} references a block that has not produced output",
                reference.raw
            ))
        })?;

        match reference.path.split_first() {
            None => Ok(output.to_value()),
            Some((PathSeg::Key(field), rest)) => {
                let head = output.get(field).ok_or_else(|| {
                    ExecutionError::Reference(format!(
                        "{} has no value at {field}",
                        reference.raw
                    ))
                })?;
                self.walk_output(&head, rest, &reference.raw)
            }
            Some((PathSeg::Index(_), _)) => Err(ExecutionError::Reference(format!(
                "{} cannot index a block output directly",
                reference.raw
            ))),
        }
    }

    fn walk_output(
        &self,
        value: &Value,
        path: &[PathSeg],
        raw: &str,
    ) -> Result<Value, ExecutionError> {
        if path.is_empty() {
            return Ok(value.clone());
        }
        walk_path(value, path)
            .ok_or_else(|| ExecutionError::Reference(format!("{raw} has no value at that path")))
    }
}

fn split_scope_path<'p>(
    path: &'p [PathSeg],
    raw: &str,
) -> Result<(&'p str, &'p [PathSeg]), ExecutionError> {
    match path.split_first() {
        Some((PathSeg::Key(head), rest)) => Ok((head.as_str(), rest)),
        _ => Err(ExecutionError::Reference(format!(
            "{raw} is missing a property"
        ))),
    }
}

/// Schema-driven coercion: strings parse to the declared type; already-typed
/// values pass through when compatible; everything else is an input error.
pub(crate) fn coerce_param(param: &str, value: Value, declared: ParamType) -> Result<Value, ExecutionError> {
    let mismatch = |value: &Value| ExecutionError::Input {
        param: param.to_string(),
        message: format!("expected {declared:?}, got {value}"),
    };
    match declared {
        ParamType::String => Ok(match value {
            Value::String(_) => value,
            other => Value::String(match other {
                Value::Object(_) | Value::Array(_) => other.to_string(),
                Value::Null => String::new(),
                scalar => scalar.to_string().trim_matches('"').to_string(),
            }),
        }),
        ParamType::Number => match value {
            Value::Number(_) => Ok(value),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| ExecutionError::Input {
                    param: param.to_string(),
                    message: format!("cannot parse {s:?} as a number"),
                }),
            other => Err(mismatch(&other)),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(ExecutionError::Input {
                    param: param.to_string(),
                    message: format!("cannot parse {s:?} as a boolean"),
                }),
            },
            other => Err(mismatch(&other)),
        },
        ParamType::Object => match value {
            Value::Object(_) => Ok(value),
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(ExecutionError::Input {
                    param: param.to_string(),
                    message: format!("cannot parse {s:?} as an object"),
                }),
            },
            other => Err(mismatch(&other)),
        },
        ParamType::Array => match value {
            Value::Array(_) => Ok(value),
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Err(ExecutionError::Input {
                    param: param.to_string(),
                    message: format!("cannot parse {s:?} as an array"),
                }),
            },
            other => Err(mismatch(&other)),
        },
    }
}
