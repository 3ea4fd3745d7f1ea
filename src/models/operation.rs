// src/models/operation.rs
//! Long-running operation handles returned by every agent submit call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Terminal error reported by the agent for an operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OperationFailure {
    #[serde(default)]
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// A handle to an asynchronous remote action.
///
/// Created by a submit call, polled until `done`, then either `response` or
/// `error` is set. Handles are never reused once terminal.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    /// Agent-scoped name, usually `<kind>.<subject>` e.g. `group.EAbc...`
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Operation {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            done: false,
            error: None,
            response: None,
            metadata: None,
        }
    }

    pub fn completed(name: impl Into<String>, response: Value) -> Self {
        Self {
            done: true,
            response: Some(response),
            ..Self::pending(name)
        }
    }

    pub fn failed(name: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            done: true,
            error: Some(OperationFailure {
                code,
                message: message.into(),
                details: None,
            }),
            ..Self::pending(name)
        }
    }

    /// The operation this one waits on, carried in `metadata.depends`.
    pub fn depends(&self) -> Option<Operation> {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.get("depends"))
            .and_then(|dep| serde_json::from_value(dep.clone()).ok())
    }
}
