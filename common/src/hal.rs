//! Hardware collaborator contract consumed by the node.
//!
//! Pins and channels are plain GPIO / ADC numbers taken from [`crate::PinConfig`].
//! Implementations live in the binaries (ESP-IDF drivers, host simulation) and in
//! test mocks.

use std::time::Duration;

use crate::error::HalError;

pub trait AnalogInput {
    fn enable(&mut self, channel: u8) -> Result<(), HalError>;
    fn read_analog(&mut self, channel: u8) -> Result<i32, HalError>;
}

pub trait DigitalOutput {
    fn set_output_mode(&mut self, pin: i32) -> Result<(), HalError>;
    fn write(&mut self, pin: i32, high: bool) -> Result<(), HalError>;
    fn read_level(&mut self, pin: i32) -> Result<bool, HalError>;

    fn toggle(&mut self, pin: i32) -> Result<bool, HalError> {
        let level = !self.read_level(pin)?;
        self.write(pin, level)?;
        Ok(level)
    }
}

/// Byte-level access to a single one-wire bus.
pub trait OneWireBus {
    /// Returns `true` when at least one device answered with a presence pulse.
    fn reset(&mut self) -> Result<bool, HalError>;
    fn skip_address(&mut self) -> Result<(), HalError>;
    fn write_byte(&mut self, byte: u8) -> Result<(), HalError>;
    fn read_byte(&mut self) -> Result<u8, HalError>;
}

/// Carrier-modulated (PWM) output. A `duty` of `0.0` drives the pin fully off.
pub trait CarrierOutput {
    fn set(&mut self, pin: i32, frequency_hz: u32, duty: f32) -> Result<(), HalError>;
}

pub trait Clock {
    fn uptime(&self) -> Duration;
}

pub trait Delay {
    fn delay_us(&mut self, us: u32);
}

/// Everything the node needs from a board, bundled so `Node` stays single-generic.
pub trait Board: AnalogInput + DigitalOutput + CarrierOutput + Clock + Delay {
    type Bus: OneWireBus;

    fn one_wire(&mut self) -> &mut Self::Bus;
}
