use log::info;

use crate::{error::HalError, hal::DigitalOutput};

/// Relay / solid-state switch on a single digital output.
#[derive(Debug, Clone, Copy)]
pub struct ActuatorSwitch {
    pin: i32,
}

impl ActuatorSwitch {
    pub fn new(pin: i32) -> Self {
        Self { pin }
    }

    /// Configure as output and start de-energised.
    pub fn init<O: DigitalOutput>(&self, out: &mut O) -> Result<(), HalError> {
        out.set_output_mode(self.pin)?;
        out.write(self.pin, false)
    }

    /// Flip the output and return the new level.
    pub fn toggle<O: DigitalOutput>(&self, out: &mut O) -> Result<bool, HalError> {
        let level = out.toggle(self.pin)?;
        info!(
            "actuator on GPIO{} switched {}",
            self.pin,
            if level { "on" } else { "off" }
        );
        Ok(level)
    }
}
