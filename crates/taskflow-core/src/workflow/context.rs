//! Execution scope with variable storage and `${path}` template resolution.
//!
//! `ExecutionScope` is shared by every step of one instance: inputs,
//! transform-bound variables, and step outputs live behind one lock. Loop
//! iterations get a child scope carrying their own `item` and `index`
//! bindings on top of the shared data.
//!
//! Template grammar is a dotted path inside `${...}`:
//! - `${item}`, `${index}` -- loop-local bindings
//! - `${inputs.<name>...}` -- instance inputs
//! - `${variables.<name>...}` or `${<name>...}` -- bound variables
//! - `${steps.<id>...}` -- output of a completed step
//!
//! Later segments index into objects by key and arrays by position. Nothing
//! is evaluated; unknown references are left as-is.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Value, json};
use tracing::{debug, warn};

/// Maximum serialized size of a single step output (1 MiB).
pub const MAX_STEP_OUTPUT_SIZE: usize = 1_048_576;

pub const ITEM_BINDING: &str = "item";
pub const INDEX_BINDING: &str = "index";

#[derive(Debug, Default)]
struct ScopeData {
    inputs: HashMap<String, Value>,
    variables: HashMap<String, Value>,
    step_outputs: HashMap<String, Value>,
}

/// Variable scope for one workflow instance.
///
/// Cloning shares the underlying data; locals are copied.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    shared: Arc<RwLock<ScopeData>>,
    locals: HashMap<String, Value>,
}

impl ExecutionScope {
    pub fn new(inputs: HashMap<String, Value>) -> Self {
        Self {
            shared: Arc::new(RwLock::new(ScopeData {
                inputs,
                ..Default::default()
            })),
            locals: HashMap::new(),
        }
    }

    /// A child scope sharing instance data with an extra local binding.
    pub fn with_local(&self, name: &str, value: Value) -> Self {
        let mut child = self.clone();
        child.locals.insert(name.to_string(), value);
        child
    }

    pub fn set_variable(&self, name: &str, value: Value) {
        self.write().variables.insert(name.to_string(), value);
    }

    /// Store a step output, replacing outputs over `MAX_STEP_OUTPUT_SIZE`
    /// with a truncation marker. Returns the value actually stored.
    pub fn set_step_output(&self, step_id: &str, output: Value) -> Value {
        let size = serde_json::to_string(&output).map(|s| s.len()).unwrap_or(0);
        let stored = if size > MAX_STEP_OUTPUT_SIZE {
            warn!(
                step_id,
                size,
                max = MAX_STEP_OUTPUT_SIZE,
                "step output exceeds size limit, truncating"
            );
            json!({
                "_truncated": true,
                "_original_size": size,
                "_message": format!("output exceeded {MAX_STEP_OUTPUT_SIZE} byte limit and was truncated"),
            })
        } else {
            output
        };
        self.write()
            .step_outputs
            .insert(step_id.to_string(), stored.clone());
        stored
    }

    pub fn step_output(&self, step_id: &str) -> Option<Value> {
        self.read().step_outputs.get(step_id).cloned()
    }

    pub fn inputs(&self) -> HashMap<String, Value> {
        self.read().inputs.clone()
    }

    pub fn variables(&self) -> HashMap<String, Value> {
        self.read().variables.clone()
    }

    pub fn step_outputs(&self) -> HashMap<String, Value> {
        self.read().step_outputs.clone()
    }

    // -- resolution --

    /// Look up a dotted path. `None` when any segment is missing.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let mut segments = path.trim().split('.');
        let root = segments.next().filter(|s| !s.is_empty())?;

        if let Some(local) = self.locals.get(root) {
            return descend(local, segments);
        }

        let data = self.read();
        match root {
            "inputs" => {
                let name = segments.next()?;
                descend(data.inputs.get(name)?, segments)
            }
            "variables" => {
                let name = segments.next()?;
                descend(data.variables.get(name)?, segments)
            }
            "steps" => {
                let step_id = segments.next()?;
                descend(data.step_outputs.get(step_id)?, segments)
            }
            name => descend(data.variables.get(name)?, segments),
        }
    }

    /// Resolve every string inside `value`, recursing into arrays and objects.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.resolve_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve a template string.
    ///
    /// A string that is exactly one `${path}` yields the referenced value
    /// with its JSON type intact. Otherwise every resolvable reference is
    /// interpolated as text and unknown references are kept verbatim.
    pub fn resolve_str(&self, template: &str) -> Value {
        if let Some(path) = single_reference(template) {
            return match self.lookup(path) {
                Some(value) => value,
                None => {
                    debug!(path, "unresolved template reference left as-is");
                    Value::String(template.to_string())
                }
            };
        }
        Value::String(self.interpolate(template))
    }

    /// Resolve a template, returning `None` when it is a single reference
    /// that does not resolve.
    pub fn resolve_optional(&self, template: &str) -> Option<Value> {
        match single_reference(template) {
            Some(path) => self.lookup(path),
            None => Some(Value::String(self.interpolate(template))),
        }
    }

    /// Resolve a transform source: a bare path or a template.
    pub fn resolve_source(&self, source: &str) -> Option<Value> {
        if source.contains("${") {
            self.resolve_optional(source)
        } else {
            self.lookup(source)
        }
    }

    fn interpolate(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let path = &after[..end];
                    match self.lookup(path) {
                        Some(value) => out.push_str(&value_to_string(&value)),
                        None => {
                            debug!(path, "unresolved template reference left as-is");
                            out.push_str(&rest[start..start + 2 + end + 1]);
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ScopeData> {
        self.shared.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ScopeData> {
        self.shared.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `Some(path)` when `template` is exactly `${path}`.
fn single_reference(template: &str) -> Option<&str> {
    let inner = template.trim().strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner.trim())
}

fn descend<'s>(value: &Value, segments: impl Iterator<Item = &'s str>) -> Option<Value> {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Render a value for text interpolation: strings raw, everything else as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
