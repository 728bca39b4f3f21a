use std::{fmt, time::Duration};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Messaging transport used for telemetry.
pub trait Transport {
    fn is_connected(&self) -> bool;

    fn publish(
        &mut self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryReading {
    pub uptime: Duration,
    pub brightness: i32,
    pub temperature_c: f32,
}

impl TelemetryReading {
    /// Wire format: `"<uptime:.2> <brightness> <temperature:.2>"`.
    pub fn payload(&self) -> String {
        format!(
            "{:.2} {} {:.2}",
            self.uptime.as_secs_f64(),
            self.brightness,
            self.temperature_c
        )
    }
}

impl fmt::Display for TelemetryReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime: {:.2} brightness: {} temperature {:.2}",
            self.uptime.as_secs_f64(),
            self.brightness,
            self.temperature_c
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Skipped,
}

/// Best-effort periodic publisher: no retry, no backlog.
#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    topic: String,
}

impl TelemetryPublisher {
    pub const QOS: Qos = Qos::AtMostOnce;
    pub const RETAIN: bool = false;

    pub fn new(topic: String) -> Self {
        Self { topic }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn publish<T: Transport>(
        &self,
        transport: &mut T,
        reading: &TelemetryReading,
    ) -> Result<PublishOutcome, TransportError> {
        info!("{reading}");

        if !transport.is_connected() {
            warn!("telemetry publishing is unavailable, transport not connected");
            return Ok(PublishOutcome::Skipped);
        }

        transport.publish(
            &self.topic,
            Self::QOS,
            Self::RETAIN,
            reading.payload().as_bytes(),
        )?;
        Ok(PublishOutcome::Published)
    }
}
