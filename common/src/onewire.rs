//! One-wire command set and scratchpad helpers for DS18B20-class sensors.

use one_wire_bus::crc::calculate_crc8;

use crate::{error::SensorError, hal::OneWireBus};

pub const CMD_CONVERT_T: u8 = 0x44;
pub const CMD_READ_SCRATCHPAD: u8 = 0xBE;
pub const CMD_WRITE_SCRATCHPAD: u8 = 0x4E;

pub const SCRATCHPAD_LEN: usize = 9;

/// Alarm thresholds and 12-bit resolution written at startup.
pub const ALARM_HIGH: u8 = 0x00;
pub const ALARM_LOW: u8 = 0x00;
pub const CONFIG_12_BIT: u8 = 0x7F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scratchpad(pub [u8; SCRATCHPAD_LEN]);

impl Scratchpad {
    /// Dallas CRC-8 over all nine bytes; zero when the trailing CRC matches.
    pub fn residue(&self) -> u8 {
        calculate_crc8(&self.0)
    }

    pub fn validate(&self) -> Result<(), SensorError> {
        match self.residue() {
            0 => Ok(()),
            residue => Err(SensorError::Crc { residue }),
        }
    }

    /// Raw temperature register, LSB first, in 1/16 °C steps.
    pub fn raw_temperature(&self) -> i16 {
        i16::from_le_bytes([self.0[0], self.0[1]])
    }

    pub fn celsius(&self) -> f32 {
        f32::from(self.raw_temperature()) / 16.0
    }
}

/// Reset the bus and address every device on it.
pub fn select_all<B: OneWireBus>(bus: &mut B) -> Result<(), SensorError> {
    if !bus.reset().map_err(SensorError::Bus)? {
        return Err(SensorError::NoPresence);
    }
    bus.skip_address().map_err(SensorError::Bus)
}

pub fn write_all<B: OneWireBus>(bus: &mut B, bytes: &[u8]) -> Result<(), SensorError> {
    for byte in bytes {
        bus.write_byte(*byte).map_err(SensorError::Bus)?;
    }
    Ok(())
}

pub fn read_scratchpad<B: OneWireBus>(bus: &mut B) -> Result<Scratchpad, SensorError> {
    select_all(bus)?;
    write_all(bus, &[CMD_READ_SCRATCHPAD])?;

    let mut bytes = [0_u8; SCRATCHPAD_LEN];
    for slot in bytes.iter_mut() {
        *slot = bus.read_byte().map_err(SensorError::Bus)?;
    }
    Ok(Scratchpad(bytes))
}

/// Write alarm thresholds and resolution, then release the bus with a reset.
pub fn configure_sensor<B: OneWireBus>(bus: &mut B) -> Result<(), SensorError> {
    select_all(bus)?;
    write_all(
        bus,
        &[CMD_WRITE_SCRATCHPAD, ALARM_HIGH, ALARM_LOW, CONFIG_12_BIT],
    )?;
    bus.reset().map_err(SensorError::Bus)?;
    Ok(())
}

/// Append the CRC byte to an 8-byte scratchpad body.
pub fn seal_scratchpad(body: [u8; SCRATCHPAD_LEN - 1]) -> Scratchpad {
    let mut bytes = [0_u8; SCRATCHPAD_LEN];
    bytes[..SCRATCHPAD_LEN - 1].copy_from_slice(&body);
    bytes[SCRATCHPAD_LEN - 1] = calculate_crc8(&body);
    Scratchpad(bytes)
}
