//! Query/mutation descriptors exported by workspaces.
//!
//! An action is a thin descriptor: a kind tag, an optional input validator,
//! an optional human description, and an async handler. The workspace
//! runtime wraps invocation so input is validated before the handler runs;
//! external adapters (HTTP, tool-call) traverse the [`ActionMap`] to expose
//! endpoints.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::BoxFuture;
use crate::error::{EpicenterError, Result};
use crate::schema::SerializedRow;
use crate::validator::{Validated, Validator};
use indexmap::IndexMap;

/// Whether an action reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Read-only
    Query,
    /// State-changing
    Mutation,
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One exported operation.
#[derive(Clone)]
pub struct Action {
    kind: ActionKind,
    description: Option<String>,
    input_validator: Option<Arc<dyn Validator>>,
    handler: Handler,
}

impl Action {
    /// A read-only action.
    pub fn query<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(ActionKind::Query, handler)
    }

    /// A state-changing action.
    pub fn mutation<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::new(ActionKind::Mutation, handler)
    }

    fn new<F, Fut>(kind: ActionKind, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            kind,
            description: None,
            input_validator: None,
            handler: Arc::new(move |input| Box::pin(handler(input))),
        }
    }

    /// Attach a human description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an input validator, run before the handler.
    pub fn with_input_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.input_validator = Some(validator);
        self
    }

    /// The kind tag.
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// The description, if any.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The input validator, if any.
    pub fn input_validator(&self) -> Option<&Arc<dyn Validator>> {
        self.input_validator.as_ref()
    }

    /// Build a [`EpicenterError::Handler`] from a handler's own failure.
    pub fn handler_error(message: impl std::fmt::Display) -> EpicenterError {
        EpicenterError::Handler {
            message: message.to_string(),
        }
    }

    /// Validate the input (when a validator is attached), then run the
    /// handler.
    pub async fn invoke(&self, input: Value) -> Result<Value> {
        let input = match &self.input_validator {
            None => input,
            Some(validator) => {
                let row: SerializedRow = match input {
                    Value::Null => SerializedRow::new(),
                    other => serde_json::from_value(other).map_err(|e| {
                        EpicenterError::Validation {
                            context: "action input".to_string(),
                            errors: vec![crate::validator::FieldError::new(
                                "",
                                format!("expected an object: {e}"),
                            )],
                        }
                    })?,
                };
                match validator.validate(&row) {
                    Validated::Valid(row) => serde_json::to_value(row)?,
                    Validated::Invalid(errors) => {
                        return Err(EpicenterError::Validation {
                            context: "action input".to_string(),
                            errors,
                        });
                    }
                }
            }
        };
        (self.handler)(input).await
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("description", &self.description)
            .finish()
    }
}

/// A node in the action tree: either a leaf action or a nested namespace.
#[derive(Debug, Clone)]
pub enum ActionNode {
    /// A leaf operation
    Action(Action),
    /// A nested namespace of further actions
    Namespace(ActionMap),
}

/// An ordered, traversable map of exported actions.
#[derive(Debug, Clone, Default)]
pub struct ActionMap {
    entries: IndexMap<String, ActionNode>,
}

impl ActionMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a leaf action.
    pub fn action(mut self, name: impl Into<String>, action: Action) -> Self {
        self.entries.insert(name.into(), ActionNode::Action(action));
        self
    }

    /// Add a nested namespace.
    pub fn namespace(mut self, name: impl Into<String>, map: ActionMap) -> Self {
        self.entries.insert(name.into(), ActionNode::Namespace(map));
        self
    }

    /// Look up an action by its name path.
    pub fn get(&self, path: &[&str]) -> Option<&Action> {
        let (head, rest) = path.split_first()?;
        match self.entries.get(*head)? {
            ActionNode::Action(action) if rest.is_empty() => Some(action),
            ActionNode::Namespace(map) if !rest.is_empty() => map.get(rest),
            _ => None,
        }
    }

    /// The direct entries of this map, in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ActionNode)> {
        self.entries.iter().map(|(name, node)| (name.as_str(), node))
    }

    /// Every action in the tree with its full name path, depth first.
    pub fn iter(&self) -> Vec<(Vec<String>, &Action)> {
        let mut out = Vec::new();
        self.collect(&mut Vec::new(), &mut out);
        out
    }

    fn collect<'a>(&'a self, prefix: &mut Vec<String>, out: &mut Vec<(Vec<String>, &'a Action)>) {
        for (name, node) in &self.entries {
            prefix.push(name.clone());
            match node {
                ActionNode::Action(action) => out.push((prefix.clone(), action)),
                ActionNode::Namespace(map) => map.collect(prefix, out),
            }
            prefix.pop();
        }
    }

    /// Number of direct entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
