use std::str::FromStr;

use serde::Serialize;

use crate::error::UnknownCommand;

/// Namespace legacy RPC clients put in front of method names (`MyApp.SendIR`).
pub const RPC_NAMESPACE: &str = "MyApp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SendIr,
    ToggleActuator,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendIr => "SendIR",
            Self::ToggleActuator => "ToggleActuator",
        }
    }
}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(method: &str) -> Result<Self, Self::Err> {
        let trimmed = method.trim();
        let name = trimmed
            .strip_prefix(RPC_NAMESPACE)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(trimmed);

        match name {
            "SendIR" => Ok(Self::SendIr),
            "ToggleActuator" | "ToggleSSR" => Ok(Self::ToggleActuator),
            _ => Err(UnknownCommand(method.to_string())),
        }
    }
}

/// Empty acknowledgement, serialised as `{}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Ack {}
