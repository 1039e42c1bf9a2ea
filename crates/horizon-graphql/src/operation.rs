//! GraphQL operation types.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The type of GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    /// A query operation (read-only).
    #[default]
    Query,
    /// A mutation operation (modifies data).
    Mutation,
    /// A subscription operation (real-time updates).
    Subscription,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Mutation => write!(f, "mutation"),
            Self::Subscription => write!(f, "subscription"),
        }
    }
}

/// Per-operation metadata carried alongside the document.
///
/// The context never goes over the wire. Links read and extend it while the
/// operation moves down the chain, and the transport router consults it when
/// picking a destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationContext {
    /// Headers to attach to the outgoing request.
    pub headers: HashMap<String, String>,
    /// Hint that this operation tolerates the batching window.
    pub batch: bool,
}

/// A GraphQL operation: the document, its variables, and routing context.
///
/// # Example
///
/// ```ignore
/// let op = Operation::mutation("mutation SetName($name: String!) { setName(name: $name) { id } }")
///     .variable("name", "bridge-7")
///     .batched();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// The GraphQL document (query/mutation/subscription text).
    pub query: String,

    /// Variables for the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,

    /// Optional operation name, required when the document holds several.
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,

    #[serde(skip)]
    operation_type: OperationType,

    #[serde(skip)]
    context: OperationContext,
}

impl Operation {
    /// Creates an operation, inferring its type from the document text.
    pub fn new(query: impl Into<String>) -> Self {
        let query = query.into();
        let operation_type = Self::infer_operation_type(&query);
        Self {
            query,
            variables: None,
            operation_name: None,
            operation_type,
            context: OperationContext::default(),
        }
    }

    /// Creates a query operation.
    pub fn query(query: impl Into<String>) -> Self {
        Self {
            operation_type: OperationType::Query,
            ..Self::new(query)
        }
    }

    /// Creates a mutation operation.
    pub fn mutation(query: impl Into<String>) -> Self {
        Self {
            operation_type: OperationType::Mutation,
            ..Self::new(query)
        }
    }

    /// Creates a subscription operation.
    pub fn subscription(query: impl Into<String>) -> Self {
        Self {
            operation_type: OperationType::Subscription,
            ..Self::new(query)
        }
    }

    /// Sets the variables for this operation.
    pub fn variables(mut self, variables: impl Serialize) -> Self {
        self.variables = serde_json::to_value(variables).ok();
        self
    }

    /// Sets a single variable, merging with any already present.
    pub fn variable(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(_) => return self,
        };
        match &mut self.variables {
            Some(Value::Object(map)) => {
                map.insert(name.into(), value);
            }
            _ => {
                let mut map = serde_json::Map::new();
                map.insert(name.into(), value);
                self.variables = Some(Value::Object(map));
            }
        }
        self
    }

    /// Sets the operation name.
    pub fn operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    /// Attaches a header to this operation only.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.headers.insert(name.into(), value.into());
        self
    }

    /// Marks this operation as tolerant of the batching window.
    pub fn batched(mut self) -> Self {
        self.context.batch = true;
        self
    }

    /// Returns the operation type.
    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// Whether this is a subscription operation.
    pub fn is_subscription(&self) -> bool {
        self.operation_type == OperationType::Subscription
    }

    /// Returns the operation context.
    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    /// Mutable access to the context, for links that transform operations.
    pub fn context_mut(&mut self) -> &mut OperationContext {
        &mut self.context
    }

    /// A stable identity for this operation's document and variables.
    ///
    /// Used as the cache key for query results. Context and operation name
    /// do not participate, so the same document with the same variables maps
    /// to the same entry regardless of how it was dispatched.
    pub fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.query.hash(&mut hasher);
        if let Some(variables) = &self.variables {
            // serde_json maps are sorted by key, so this is deterministic
            variables.to_string().hash(&mut hasher);
        }
        hasher.finish()
    }

    fn infer_operation_type(query: &str) -> OperationType {
        let trimmed = query.trim_start();
        if trimmed.starts_with("mutation") {
            OperationType::Mutation
        } else if trimmed.starts_with("subscription") {
            OperationType::Subscription
        } else {
            OperationType::Query
        }
    }
}
