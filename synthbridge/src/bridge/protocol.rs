//! Message type exchanged with the worker.
//!
//! The worker protocol has no envelope: every frame is a bare JSON object whose
//! `command` key names the operation. The bridge only cares about `command`
//! (and `error` in replies); everything else is forwarded untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command that must be sent once, right after the worker starts.
pub const INITIALIZE: &str = "initialize";
/// Command for a synthesis request.
pub const SYNTHESIZE: &str = "synthesize";
/// Liveness probe answered by the worker with `{"status": "pong"}`.
pub const PING: &str = "ping";

/// A JSON object sent to or received from the worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with only the `command` field set.
    pub fn command(command: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("command".to_string(), Value::String(command.into()));
        Self(map)
    }

    pub fn initialize() -> Self {
        Self::command(INITIALIZE)
    }

    /// Parse a message from raw JSON bytes. Anything other than an object is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The `command` field, if present and a string.
    pub fn command_name(&self) -> Option<&str> {
        self.0.get("command").and_then(Value::as_str)
    }

    /// The `error` field of a worker reply, if any.
    pub fn error(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Copy every field of `other` into `self`; fields of `other` win.
    pub fn merge(mut self, other: Message) -> Self {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Message {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}
