use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::time::DateTime;
use crate::outlet::{ChannelId, OutletState};

pub type CommandBatch = BTreeMap<ChannelId, Vec<OutletCommand>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletCommand {
    pub time: DateTime,
    pub state: CommandedState,
    #[serde(rename = "isLast", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum CommandedState {
    On,
    Off,
    Invalid(Value),
}

impl OutletCommand {
    pub fn new(time: DateTime, state: OutletState) -> Self {
        Self {
            time,
            state: state.into(),
            is_last: false,
        }
    }

    pub fn last(mut self) -> Self {
        self.is_last = true;
        self
    }
}

impl CommandedState {
    pub fn outlet_state(&self) -> Option<OutletState> {
        match self {
            CommandedState::On => Some(OutletState::On),
            CommandedState::Off => Some(OutletState::Off),
            CommandedState::Invalid(_) => None,
        }
    }
}

impl From<OutletState> for CommandedState {
    fn from(state: OutletState) -> Self {
        match state {
            OutletState::On => CommandedState::On,
            OutletState::Off => CommandedState::Off,
        }
    }
}

impl From<Value> for CommandedState {
    fn from(value: Value) -> Self {
        match &value {
            Value::Number(n) if n.as_u64() == Some(1) => CommandedState::On,
            Value::Number(n) if n.as_u64() == Some(0) => CommandedState::Off,
            Value::String(s) if s.eq_ignore_ascii_case("ON") => CommandedState::On,
            Value::String(s) if s.eq_ignore_ascii_case("OFF") => CommandedState::Off,
            _ => CommandedState::Invalid(value),
        }
    }
}

impl From<CommandedState> for Value {
    fn from(state: CommandedState) -> Self {
        match state {
            CommandedState::On => Value::from(1),
            CommandedState::Off => Value::from(0),
            CommandedState::Invalid(value) => value,
        }
    }
}
