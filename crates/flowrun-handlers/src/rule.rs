//! Comparison rules shared by the condition and router handlers. Operands
//! arrive already reference-resolved by the engine; rules only compare values.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    /// Always matches; used for else/default branches.
    Always,
}

/// One comparison between two resolved values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub left: Value,
    pub operator: Operator,
    #[serde(default)]
    pub right: Value,
}

impl Rule {
    pub fn matches(&self) -> bool {
        match self.operator {
            Operator::Always => true,
            Operator::Equals => values_equal(&self.left, &self.right),
            Operator::NotEquals => !values_equal(&self.left, &self.right),
            Operator::Contains => contains(&self.left, &self.right),
            Operator::GreaterThan => compare(&self.left, &self.right)
                .is_some_and(|ord| ord == std::cmp::Ordering::Greater),
            Operator::LessThan => compare(&self.left, &self.right)
                .is_some_and(|ord| ord == std::cmp::Ordering::Less),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Equality with numeric coercion: `"5"` equals `5`.
fn values_equal(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l == r,
        _ => false,
    }
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::String(haystack) => match right {
            Value::String(needle) => haystack.contains(needle),
            other => haystack.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, right)),
        Value::Object(map) => right
            .as_str()
            .is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => match (left, right) {
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => None,
        },
    }
}
