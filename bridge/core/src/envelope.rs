//! Call and result envelopes
//!
//! Envelopes are serialized as JSON and carried as frame payloads.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::role::ProcessRole;

/// Pairs a call with its result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Fresh random id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Positional and keyword arguments of a call
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    /// Ordered arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positional: Vec<Value>,
    /// Named arguments
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub keyword: Map<String, Value>,
}

impl CallArgs {
    /// No arguments
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Positional arguments only
    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keyword: Map::new(),
        }
    }

    /// Add a keyword argument
    #[must_use]
    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Positional argument at `index`
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Keyword argument `name`
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// True when there are neither positional nor keyword arguments
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// A request to run a callback in the peer process
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// Ties a result to its call
    pub correlation_id: CorrelationId,
    /// Role of the sender; results go to its results mailbox
    pub caller: ProcessRole,
    /// Callback identifier in the receiving registry
    pub target: String,
    /// Arguments for the callback
    #[serde(default)]
    pub args: CallArgs,
}

impl CallEnvelope {
    /// Call with a fresh correlation id
    pub fn new(caller: ProcessRole, target: impl Into<String>, args: CallArgs) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            caller,
            target: target.into(),
            args,
        }
    }
}

/// Outcome of a dispatched call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The callback returned a value
    Ok {
        /// Returned value
        value: Value,
    },
    /// The callback failed or could not be dispatched
    Error {
        /// Human-readable description
        message: String,
    },
}

/// Answer to a [`CallEnvelope`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Ties a result to its call
    pub correlation_id: CorrelationId,
    /// What the callback produced
    pub outcome: CallOutcome,
}

impl ResultEnvelope {
    /// Successful result
    pub fn ok(correlation_id: CorrelationId, value: Value) -> Self {
        Self {
            correlation_id,
            outcome: CallOutcome::Ok { value },
        }
    }

    /// Failed result carrying `message`
    pub fn error(correlation_id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            correlation_id,
            outcome: CallOutcome::Error {
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CallOutcome::Ok { .. })
    }
}

/// Serialize an envelope to a frame payload
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Deserialize an envelope from a frame payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
