use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural problems found while building a graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphDefinitionError {
    #[error("duplicate node id '{id}' in graph '{graph}'")]
    DuplicateNodeId { graph: String, id: String },

    #[error("graph '{graph}': {context} references undeclared node '{id}'")]
    UnknownNodeReference {
        graph: String,
        id: String,
        context: String,
    },

    #[error("graph '{graph}' has no {missing} node")]
    MissingStartOrFinish { graph: String, missing: String },

    /// More than one problem was found; the first one is the headline.
    #[error("{}", summarize(.0))]
    Multiple(Vec<GraphDefinitionError>),
}

fn summarize(all: &[GraphDefinitionError]) -> String {
    match all {
        [] => "no problems".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

impl GraphDefinitionError {
    /// Flatten into the individual problems.
    pub fn problems(&self) -> Vec<&GraphDefinitionError> {
        match self {
            Self::Multiple(all) => all.iter().flat_map(|e| e.problems()).collect(),
            other => vec![other],
        }
    }
}

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph errors
    #[error("Graph definition error: {0}")]
    GraphDefinition(#[from] GraphDefinitionError),

    #[error("No route from node '{node}' in graph '{graph}' for output of kind '{kind}'")]
    NoRoute {
        graph: String,
        node: String,
        kind: String,
    },

    #[error("Node '{node}' in graph '{graph}' failed: {source}")]
    NodeExecution {
        graph: String,
        node: String,
        #[source]
        source: Box<WeftError>,
    },

    /// Free-form failure raised by a node body.
    #[error("{0}")]
    Node(String),

    #[error("Run cancelled")]
    Cancelled,

    // Storage errors
    #[error("Storage key '{key}' holds {found}, requested as {expected}")]
    StorageTypeMismatch {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Storage key '{0}' not set")]
    StorageKeyMissing(String),

    // Pipeline errors
    #[error("Hook {hook} of feature '{feature}' failed: {message}")]
    HookFailed {
        feature: String,
        hook: String,
        message: String,
    },

    #[error("Feature already installed: {0}")]
    FeatureAlreadyInstalled(String),

    #[error("Feature not installed: {0}")]
    FeatureNotInstalled(String),

    #[error("Feature '{0}' instance has a different type than requested")]
    FeatureTypeMismatch(String),

    // Collaborator errors
    #[error("Model call failed: {0}")]
    ModelCall(String),

    #[error("Model service not configured")]
    ModelUnavailable,

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool input validation failed: {tool}: {message}")]
    ToolValidation { tool: String, message: String },

    #[error("Tool service not configured")]
    ToolUnavailable,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification callers use to decide what to do with a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GraphDefinition,
    NoRoute,
    NodeExecution,
    StorageTypeMismatch,
    Cancelled,
    Hook,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::GraphDefinition => "graph_definition",
            Self::NoRoute => "no_route",
            Self::NodeExecution => "node_execution",
            Self::StorageTypeMismatch => "storage_type_mismatch",
            Self::Cancelled => "cancelled",
            Self::Hook => "hook",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl WeftError {
    /// Shorthand for a node-body failure.
    pub fn node(message: impl Into<String>) -> Self {
        Self::Node(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::GraphDefinition(_) => ErrorKind::GraphDefinition,
            Self::NoRoute { .. } => ErrorKind::NoRoute,
            Self::NodeExecution { .. } => ErrorKind::NodeExecution,
            Self::StorageTypeMismatch { .. } => ErrorKind::StorageTypeMismatch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::HookFailed { .. } => ErrorKind::Hook,
            _ => ErrorKind::Other,
        }
    }

    /// Errors that already describe why a run stopped and must reach the
    /// caller unchanged, even when raised inside a nested graph.
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            Self::NoRoute { .. }
                | Self::NodeExecution { .. }
                | Self::StorageTypeMismatch { .. }
                | Self::Cancelled
                | Self::HookFailed { .. }
        )
    }

    /// Innermost error behind any `NodeExecution` wrapping.
    pub fn root_cause(&self) -> &WeftError {
        match self {
            Self::NodeExecution { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_distinguish_run_failures() {
        let no_route = WeftError::NoRoute {
            graph: "g".into(),
            node: "a".into(),
            kind: "value".into(),
        };
        assert_eq!(no_route.kind(), ErrorKind::NoRoute);
        assert!(no_route.is_run_terminal());

        let wrapped = WeftError::NodeExecution {
            graph: "g".into(),
            node: "a".into(),
            source: Box::new(WeftError::node("boom")),
        };
        assert_eq!(wrapped.kind(), ErrorKind::NodeExecution);
        assert!(matches!(wrapped.root_cause(), WeftError::Node(m) if m == "boom"));

        assert_eq!(WeftError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(!WeftError::ModelCall("x".into()).is_run_terminal());
    }

    #[test]
    fn multiple_definition_errors_flatten() {
        let err = GraphDefinitionError::Multiple(vec![
            GraphDefinitionError::DuplicateNodeId {
                graph: "g".into(),
                id: "a".into(),
            },
            GraphDefinitionError::MissingStartOrFinish {
                graph: "g".into(),
                missing: "finish".into(),
            },
        ]);
        assert_eq!(err.problems().len(), 2);
        assert!(err.to_string().contains("duplicate node id 'a'"));
        assert!(err.to_string().contains("1 more"));
    }
}
