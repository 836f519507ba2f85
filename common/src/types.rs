use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::OptionMapping,
    state::DeviceState,
};

pub const OPTION_START_DELAY: u32 = 558;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlState {
    Idle,
    Start,
}

impl ControlState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Start => "START",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "delaySecs", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleDecision {
    StartNow,
    StartIn(u32),
    NoEligibleSlot,
}

impl ScheduleDecision {
    pub fn delay_secs(self) -> Option<u32> {
        match self {
            Self::StartIn(secs) => Some(secs),
            Self::StartNow | Self::NoEligibleSlot => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandPath {
    #[serde(rename = "/ro/selectedProgram")]
    SelectProgram,
    #[serde(rename = "/ro/activeProgram")]
    ActivateProgram,
}

impl CommandPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelectProgram => "/ro/selectedProgram",
            Self::ActivateProgram => "/ro/activeProgram",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramOption {
    pub uid: u32,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRequest {
    pub program: u32,
    pub options: Vec<ProgramOption>,
}

impl ProgramRequest {
    pub fn build(
        program: u32,
        state: &DeviceState,
        mirrored: &[OptionMapping],
        delay_secs: Option<u32>,
    ) -> Self {
        let mut options: Vec<ProgramOption> = mirrored
            .iter()
            .filter_map(|mapping| {
                let value = option_value(state.get(&mapping.key)?)?;
                Some(ProgramOption {
                    uid: mapping.uid,
                    value,
                })
            })
            .collect();

        if let Some(delay) = delay_secs.filter(|delay| *delay > 0) {
            options.push(ProgramOption {
                uid: OPTION_START_DELAY,
                value: i64::from(delay),
            });
        }

        Self { program, options }
    }

    pub fn start_delay(&self) -> Option<i64> {
        self.options
            .iter()
            .find(|option| option.uid == OPTION_START_DELAY)
            .map(|option| option.value)
    }
}

// `true` is 1, positive integers pass through.
fn option_value(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(true) => Some(1),
        Value::Number(number) => number.as_i64().filter(|n| *n > 0),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedCommand {
    pub path: CommandPath,
    pub request: ProgramRequest,
    #[serde(rename = "issuedAtEpoch")]
    pub issued_at_epoch: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: &'static str,
    pub connected: bool,
    #[serde(rename = "lastDecision")]
    pub last_decision: Option<ScheduleDecision>,
    #[serde(rename = "nextDeadlineEpoch")]
    pub next_deadline_epoch: Option<i64>,
    #[serde(rename = "lastCommand")]
    pub last_command: Option<IssuedCommand>,
    #[serde(rename = "eventsProcessed")]
    pub events_processed: u64,
    #[serde(rename = "malformedEvents")]
    pub malformed_events: u64,
    #[serde(rename = "deviceState")]
    pub device_state: DeviceState,
    pub timezone: String,
}
