//! GraphQL response types.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClientError, Result};

/// A GraphQL response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLResponse {
    /// The data returned by the operation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Errors reported by the server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,

    /// Optional extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLResponse {
    /// Builds an error-free response around a data value.
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
            extensions: None,
        }
    }

    /// Whether the response contains any errors.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether the response is a success (has data, no errors).
    pub fn is_success(&self) -> bool {
        self.data.is_some() && !self.has_errors()
    }

    /// Returns the first error, if any.
    pub fn first_error(&self) -> Option<&GraphQLError> {
        self.errors.first()
    }

    /// Returns all error messages joined by "; ".
    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(|e| e.message.clone())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Deserializes the data into the given type.
    ///
    /// Fails when the response carries errors or has no data.
    pub fn data<T: DeserializeOwned>(&self) -> Result<T> {
        if self.has_errors() {
            return Err(ClientError::Graphql {
                response: self.clone(),
            });
        }
        match &self.data {
            Some(data) => serde_json::from_value(data.clone()).map_err(ClientError::from),
            None => Err(ClientError::Request("response contained no data".to_string())),
        }
    }

    /// Extracts a single field from the data by path.
    ///
    /// ```ignore
    /// let name: String = response.field(&["user", "name"])?;
    /// ```
    pub fn field<T: DeserializeOwned>(&self, path: &[&str]) -> Result<T> {
        let mut current = self
            .data
            .as_ref()
            .ok_or_else(|| ClientError::Request("response contained no data".to_string()))?;
        for segment in path {
            current = current.get(segment).ok_or_else(|| {
                ClientError::Request(format!("field not found: {}", path.join(".")))
            })?;
        }
        serde_json::from_value(current.clone()).map_err(ClientError::from)
    }

    /// Returns the raw data value, if present.
    pub fn raw_data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Converts to a Result, failing when the response carries errors.
    pub fn into_result(self) -> Result<Self> {
        if self.has_errors() {
            Err(ClientError::Graphql { response: self })
        } else {
            Ok(self)
        }
    }
}

/// An error within a GraphQL response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,

    /// Locations in the query where the error occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<GraphQLLocation>>,

    /// Path to the field that caused the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,

    /// Additional error information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    /// The machine-readable error code from extensions, when the server
    /// provides one.
    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }
}

impl std::fmt::Display for GraphQLError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(path) = &self.path {
            let path_str = path
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(".");
            write!(f, " (at {path_str})")?;
        }
        Ok(())
    }
}

/// A location in a GraphQL document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLLocation {
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed).
    pub column: u32,
}

/// A segment in an error path: either a field name or a list index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A field name.
    Field(String),
    /// A list index.
    Index(u64),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Field(name) => write!(f, "{name}"),
            Self::Index(idx) => write!(f, "{idx}"),
        }
    }
}
