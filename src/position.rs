//! Position types for habitat-core.
//!
//! A position is a long-lived logical worker slot. It references a program
//! (its role definition), carries a status and a current-task pointer, and
//! owns a list of output routes that chain completed results to other
//! positions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::task::TaskId;

/// Unique identifier for a position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionId(pub String);

impl PositionId {
    /// Generate a new position ID using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(format!("pos-{}", Uuid::now_v7()))
    }
}

impl Default for PositionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PositionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PositionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a program definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProgramId(pub String);

impl std::fmt::Display for ProgramId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role definition a position executes under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    /// Unique program identifier.
    pub id: ProgramId,
    /// Human-readable name.
    pub name: String,
    /// Role instructions handed to the executor.
    pub instructions: String,
    /// Backend model hint, if any.
    pub model: Option<String>,
}

impl Program {
    /// Create a new program.
    pub fn new(id: impl Into<String>, name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: ProgramId(id.into()),
            name: name.into(),
            instructions: instructions.into(),
            model: None,
        }
    }
}

/// Position status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    /// Ready to accept a task.
    Idle,
    /// Currently executing a task.
    Busy,
    /// Last execution failed.
    Error,
    /// Taken out of rotation.
    Stopped,
}

/// A long-lived logical worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique position identifier.
    pub id: PositionId,
    /// Program this position runs.
    pub program: ProgramId,
    /// Current status.
    pub status: PositionStatus,
    /// Task currently executing, if any.
    pub current_task: Option<TaskId>,
    /// Output routes evaluated after successful completions.
    pub routes: Vec<OutputRoute>,
    /// When the position was created.
    pub created_at: DateTime<Utc>,
    /// When the position was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a new idle position for the given program.
    pub fn new(program: ProgramId) -> Self {
        let now = Utc::now();
        Self {
            id: PositionId::new(),
            program,
            status: PositionStatus::Idle,
            current_task: None,
            routes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add an output route.
    pub fn with_route(mut self, route: OutputRoute) -> Self {
        self.routes.push(route);
        self
    }
}

/// Declarative forwarding rule: when a task whose type matches `pattern`
/// completes successfully on the owning position, its result is dispatched
/// to `target`, optionally gated by a predicate and reshaped by a transform.
///
/// Predicates and transforms are small serializable expressions rather than
/// closures, so a reloaded position keeps its full routing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRoute {
    /// Task-type pattern: exact string, trailing-`*` prefix, or `*`.
    pub pattern: String,
    /// Position the result is forwarded to.
    pub target: PositionId,
    /// Optional gate over the completed task's result.
    pub predicate: Option<RoutePredicate>,
    /// Optional reshaping of the result before forwarding.
    pub transform: Option<RouteTransform>,
}

impl OutputRoute {
    /// Create a route with no predicate or transform.
    pub fn new(pattern: impl Into<String>, target: PositionId) -> Self {
        Self {
            pattern: pattern.into(),
            target,
            predicate: None,
            transform: None,
        }
    }

    /// Set the predicate.
    pub fn with_predicate(mut self, predicate: RoutePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Set the transform.
    pub fn with_transform(mut self, transform: RouteTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Check whether this route applies to a task type.
    pub fn matches(&self, task_type: &str) -> bool {
        if self.pattern == "*" {
            return true;
        }
        if let Some(prefix) = self.pattern.strip_suffix('*') {
            return task_type.starts_with(prefix);
        }
        self.pattern == task_type
    }
}

/// Predicate over a result: look up a dotted field path and either compare
/// it against an expected value or test it for truthiness.
///
/// A missing path is an evaluation error, not a `false`: the caller logs it
/// and skips the route, matching the containment rules for route faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePredicate {
    /// Dotted path into the result, e.g. `report.status`.
    pub field: String,
    /// Expected value; when absent the field is tested for truthiness.
    pub equals: Option<Value>,
}

impl RoutePredicate {
    /// Require a field to equal a value.
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            equals: Some(value),
        }
    }

    /// Require a field to be present and truthy.
    pub fn truthy(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            equals: None,
        }
    }

    /// Evaluate against a result payload.
    pub fn evaluate(&self, result: &Value) -> Result<bool> {
        let found = lookup(result, &self.field)
            .ok_or_else(|| Error::Route(format!("predicate field not found: {}", self.field)))?;
        match &self.equals {
            Some(expected) => Ok(found == expected),
            None => Ok(is_truthy(found)),
        }
    }
}

/// Field-mapping transform: builds a new object where each output key is
/// filled from a dotted path into the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTransform {
    /// Output key to source path.
    pub fields: BTreeMap<String, String>,
}

impl RouteTransform {
    /// Create a transform from (output key, source path) pairs.
    ///
    /// Fails on an empty mapping, which would forward an empty object and
    /// is always a configuration mistake.
    pub fn new<K, P>(fields: impl IntoIterator<Item = (K, P)>) -> Result<Self>
    where
        K: Into<String>,
        P: Into<String>,
    {
        let fields: BTreeMap<String, String> = fields.into_iter().map(|(k, p)| (k.into(), p.into())).collect();
        if fields.is_empty() {
            return Err(Error::Validation("route transform needs at least one field".to_string()));
        }
        Ok(Self { fields })
    }

    /// Apply to a result payload.
    pub fn apply(&self, result: &Value) -> Result<Value> {
        let mut out = serde_json::Map::new();
        for (key, path) in &self.fields {
            let found = lookup(result, path)
                .ok_or_else(|| Error::Route(format!("transform field not found: {path}")))?;
            out.insert(key.clone(), found.clone());
        }
        Ok(Value::Object(out))
    }
}

/// Resolve a dotted path inside a JSON value. Array segments may be
/// numeric indices.
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
