pub mod actuator;
pub mod brightness;
pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod hal;
pub mod ir;
pub mod ir_codes;
pub mod link;
pub mod node;
pub mod onewire;
pub mod schedule;
pub mod telemetry;
pub mod temperature;
pub mod topics;

#[cfg(test)]
mod mock;

pub use command::{Ack, Command};
pub use config::{IrHardwareConfig, NetworkConfig, NodeConfig, PinConfig, TaskPeriods};
pub use error::{ConfigError, HalError, SensorError, StartupError, TaskError, TransportError};
pub use hal::{AnalogInput, Board, CarrierOutput, Clock, Delay, DigitalOutput, OneWireBus};
pub use link::LinkState;
pub use node::{Node, Readings};
pub use schedule::{NodeTask, TaskSchedule};
pub use telemetry::{PublishOutcome, Qos, TelemetryReading, Transport};
pub use topics::*;
