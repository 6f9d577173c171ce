//! Conversion between structured records and the persistent map.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use storex_map::PersistentMap;

use crate::error::{StoreError, StoreResult};

/// A JSON object held as a persistent map of its top-level fields.
pub type Record = PersistentMap<String, Value>;

/// Top-level fields of a JSON object as a [`Record`].
pub fn to_persistent(value: &Value) -> StoreResult<Record> {
    match value {
        Value::Object(fields) => Ok(fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()),
        other => Err(StoreError::Validation(format!(
            "expected a JSON object, got {}",
            json_kind(other)
        ))),
    }
}

pub fn to_json(record: &Record) -> Value {
    Value::Object(
        record
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    )
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub trait ToState {
    fn to_state(&self) -> StoreResult<Record>;
}

impl<T: Serialize> ToState for T {
    fn to_state(&self) -> StoreResult<Record> {
        let value =
            serde_json::to_value(self).map_err(|e| StoreError::Validation(e.to_string()))?;
        to_persistent(&value)
    }
}

pub trait FromState: Sized {
    fn from_state(record: &Record) -> StoreResult<Self>;
}

impl<T: DeserializeOwned> FromState for T {
    fn from_state(record: &Record) -> StoreResult<Self> {
        serde_json::from_value(to_json(record)).map_err(|e| StoreError::Validation(e.to_string()))
    }
}
