use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::MalformedEventError;

pub const KEY_DOOR_STATE: &str = "BSH.Common.Status.DoorState";
pub const KEY_REMOTE_START_ALLOWED: &str = "BSH.Common.Status.RemoteControlStartAllowed";
pub const KEY_ACTIVE_PROGRAM: &str = "BSH.Common.Status.ActiveProgram";
pub const KEY_POWER_STATE: &str = "BSH.Common.Setting.PowerState";
pub const KEY_OPERATION_STATE: &str = "BSH.Common.Status.OperationState";
pub const KEY_REMAINING_PROGRAM_TIME: &str = "BSH.Common.Option.RemainingProgramTime";

// A JSON `null` is stored as-is and reads the same as a missing key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DeviceState {
    values: BTreeMap<String, Value>,
}

impl DeviceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn merge(&mut self, delta: Map<String, Value>) -> usize {
        let written = delta.len();
        self.values.extend(delta);
        written
    }

    pub fn merge_json(&mut self, raw: &[u8]) -> Result<usize, MalformedEventError> {
        let value: Value = serde_json::from_slice(raw)
            .map_err(|err| MalformedEventError::InvalidJson(err.to_string()))?;

        match value {
            Value::Object(delta) => Ok(self.merge(delta)),
            other => Err(MalformedEventError::NotAnObject {
                found: json_kind(&other),
            }),
        }
    }

    pub fn remaining_program_time(&self) -> Option<Duration> {
        self.get(KEY_REMAINING_PROGRAM_TIME)
            .and_then(Value::as_u64)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceContext {
    state: Arc<Mutex<DeviceState>>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub written: Result<usize, MalformedEventError>,
    pub snapshot: DeviceState,
}

impl DeviceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.lock().clone()
    }

    pub fn merge_json(&self, raw: &[u8]) -> Result<usize, MalformedEventError> {
        self.lock().merge_json(raw)
    }

    pub fn merge_and_snapshot(&self, raw: &[u8]) -> MergeOutcome {
        let mut state = self.lock();
        let written = state.merge_json(raw);
        MergeOutcome {
            written,
            snapshot: state.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking writer cannot leave the map half-merged; extend is the only mutation.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
