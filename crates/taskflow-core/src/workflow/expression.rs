//! Condition evaluation for skip conditions and CONDITION steps.
//!
//! A condition is `left <operator> right`: the left template is resolved
//! against the execution scope, the right side is a literal. There is no
//! expression language; `contains` and the ordering operators are the only
//! non-equality comparisons.

use serde_json::Value;
use taskflow_types::workflow::{Condition, ConditionOperator};
use tracing::debug;

use super::context::{ExecutionScope, value_to_string};

/// Stateless condition evaluator.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn evaluate(condition: &Condition, scope: &ExecutionScope) -> bool {
        let left = scope.resolve_optional(&condition.left);
        let result = Self::compare(left.as_ref(), condition.operator, &condition.right);
        debug!(
            left = %condition.left,
            operator = ?condition.operator,
            right = %condition.right,
            result,
            "condition evaluated"
        );
        result
    }

    /// Compare a resolved left value (`None` when unresolved) with a literal.
    pub fn compare(left: Option<&Value>, operator: ConditionOperator, right: &Value) -> bool {
        match operator {
            ConditionOperator::Exists => left.is_some_and(|v| !v.is_null()),
            ConditionOperator::Equals => Self::loose_eq(left.unwrap_or(&Value::Null), right),
            ConditionOperator::NotEquals => !Self::loose_eq(left.unwrap_or(&Value::Null), right),
            ConditionOperator::GreaterThan => left
                .and_then(|l| Self::ordering(l, right))
                .is_some_and(|o| o.is_gt()),
            ConditionOperator::LessThan => left
                .and_then(|l| Self::ordering(l, right))
                .is_some_and(|o| o.is_lt()),
            ConditionOperator::Contains => left.is_some_and(|l| Self::contains(l, right)),
        }
    }

    /// Equality that treats `3` and `3.0` as equal and compares strings
    /// against scalars by their text form.
    fn loose_eq(left: &Value, right: &Value) -> bool {
        if left == right {
            return true;
        }
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (Value::String(s), other @ (Value::Number(_) | Value::Bool(_)))
            | (other @ (Value::Number(_) | Value::Bool(_)), Value::String(s)) => {
                *s == value_to_string(other)
            }
            _ => false,
        }
    }

    fn ordering(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
        match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
    }

    fn contains(left: &Value, right: &Value) -> bool {
        match left {
            Value::String(haystack) => haystack.contains(&value_to_string(right)),
            Value::Array(items) => items.iter().any(|item| Self::loose_eq(item, right)),
            Value::Object(map) => right.as_str().is_some_and(|key| map.contains_key(key)),
            _ => false,
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
