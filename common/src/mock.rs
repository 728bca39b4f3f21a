//! In-memory hardware used by unit tests.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    error::{HalError, TransportError},
    hal::{AnalogInput, Board, CarrierOutput, Clock, Delay, DigitalOutput, OneWireBus},
    onewire::Scratchpad,
    telemetry::{Qos, Transport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBus {
    pub present: bool,
    pub fail_reads: bool,
    pub resets: usize,
    pub skips: usize,
    pub written: Vec<u8>,
    pub reads: VecDeque<u8>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self {
            present: true,
            fail_reads: false,
            resets: 0,
            skips: 0,
            written: Vec::new(),
            reads: VecDeque::new(),
        }
    }
}

impl MockBus {
    pub fn queue_scratchpad(&mut self, pad: Scratchpad) {
        self.reads.extend(pad.0);
    }
}

impl OneWireBus for MockBus {
    fn reset(&mut self) -> Result<bool, HalError> {
        self.resets += 1;
        Ok(self.present)
    }

    fn skip_address(&mut self) -> Result<(), HalError> {
        self.skips += 1;
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), HalError> {
        self.written.push(byte);
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, HalError> {
        if self.fail_reads {
            return Err(HalError::new("onewire", "read slot timed out"));
        }
        // An idle bus floats high.
        Ok(self.reads.pop_front().unwrap_or(0xFF))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CarrierEvent {
    pub pin: i32,
    pub frequency_hz: u32,
    pub duty: f32,
    pub at_us: u64,
}

#[derive(Debug, Default)]
pub struct MockBoard {
    pub now: Duration,
    pub analog: VecDeque<i32>,
    pub analog_fault: bool,
    pub enabled_channels: Vec<u8>,
    pub output_pins: Vec<i32>,
    pub levels: HashMap<i32, bool>,
    pub carrier: Vec<CarrierEvent>,
    pub delayed_us: u64,
    pub bus: MockBus,
}

impl AnalogInput for MockBoard {
    fn enable(&mut self, channel: u8) -> Result<(), HalError> {
        self.enabled_channels.push(channel);
        Ok(())
    }

    fn read_analog(&mut self, _channel: u8) -> Result<i32, HalError> {
        if self.analog_fault {
            return Err(HalError::new("adc", "conversion timeout"));
        }
        Ok(self.analog.pop_front().unwrap_or(0))
    }
}

impl DigitalOutput for MockBoard {
    fn set_output_mode(&mut self, pin: i32) -> Result<(), HalError> {
        self.output_pins.push(pin);
        Ok(())
    }

    fn write(&mut self, pin: i32, high: bool) -> Result<(), HalError> {
        self.levels.insert(pin, high);
        Ok(())
    }

    fn read_level(&mut self, pin: i32) -> Result<bool, HalError> {
        Ok(self.levels.get(&pin).copied().unwrap_or(false))
    }
}

impl CarrierOutput for MockBoard {
    fn set(&mut self, pin: i32, frequency_hz: u32, duty: f32) -> Result<(), HalError> {
        self.carrier.push(CarrierEvent {
            pin,
            frequency_hz,
            duty,
            at_us: self.delayed_us,
        });
        Ok(())
    }
}

impl Clock for MockBoard {
    fn uptime(&self) -> Duration {
        self.now
    }
}

impl Delay for MockBoard {
    fn delay_us(&mut self, us: u32) {
        self.delayed_us += u64::from(us);
    }
}

impl Board for MockBoard {
    type Bus = MockBus;

    fn one_wire(&mut self) -> &mut MockBus {
        &mut self.bus
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: Qos,
    pub retain: bool,
    pub payload: String,
}

#[derive(Debug, Default)]
pub struct MockTransport {
    pub connected: bool,
    pub reject: bool,
    pub published: Vec<Published>,
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.reject {
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                message: "request queue full".to_string(),
            });
        }
        self.published.push(Published {
            topic: topic.to_string(),
            qos,
            retain,
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        Ok(())
    }
}
