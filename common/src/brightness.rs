use log::debug;

use crate::{error::SensorError, filter::MovingAverage, hal::AnalogInput};

/// Ambient-light acquisition on one ADC channel.
#[derive(Debug, Clone)]
pub struct BrightnessSampler {
    channel: u8,
    history: MovingAverage<i32>,
}

impl BrightnessSampler {
    pub fn new(channel: u8) -> Self {
        Self {
            channel,
            history: MovingAverage::new(),
        }
    }

    pub fn mean(&self) -> i32 {
        self.history.mean()
    }

    /// Take one reading and return the updated mean. A failed read leaves the
    /// window untouched.
    pub fn sample<A: AnalogInput>(&mut self, adc: &mut A) -> Result<i32, SensorError> {
        let raw = adc
            .read_analog(self.channel)
            .map_err(|source| SensorError::Analog {
                channel: self.channel,
                source,
            })?;

        self.history.push(raw);
        let mean = self.history.mean();
        debug!("updated brightness: raw {raw}, mean {mean}");
        Ok(mean)
    }
}
