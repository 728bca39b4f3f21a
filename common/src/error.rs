use thiserror::Error;

/// Failure reported by a hardware collaborator (ADC, GPIO, one-wire, PWM).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{peripheral}: {message}")]
pub struct HalError {
    pub peripheral: &'static str,
    pub message: String,
}

impl HalError {
    pub fn new(peripheral: &'static str, message: impl Into<String>) -> Self {
        Self {
            peripheral,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("analog read on channel {channel} failed: {source}")]
    Analog { channel: u8, source: HalError },
    #[error("one-wire bus fault: {0}")]
    Bus(HalError),
    #[error("no presence pulse on one-wire bus")]
    NoPresence,
    #[error("scratchpad CRC mismatch (residue {residue:#04x})")]
    Crc { residue: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("topic template `{template}` has unsupported conversion `%{conversion}`")]
    UnsupportedConversion { template: String, conversion: char },
    #[error("topic template `{0}` ends with a dangling `%`")]
    DanglingPercent(String),
    #[error("topic template `{0}` expects more than one device id argument")]
    TooManyArguments(String),
    #[error("rendered topic is {len} bytes, limit is {max}")]
    TopicTooLong { len: usize, max: usize },
    #[error("rendered topic is empty")]
    EmptyTopic,
    #[error("device id is empty")]
    EmptyDeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command `{0}`")]
pub struct UnknownCommand(pub String);

/// Failure of one periodic task. Never fatal: the next tick retries naturally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("hardware setup failed: {0}")]
    Hardware(#[from] HalError),
}
