//! Software-timed infrared transmitter.
//!
//! Each table entry toggles a PWM carrier between the configured duty and fully
//! off, then busy-waits for the entry's duration. The caller is blocked for the
//! whole frame.

use log::{info, warn};
use serde::Serialize;

use crate::{
    config::IrHardwareConfig,
    error::HalError,
    hal::{CarrierOutput, Delay},
};

pub struct IrTransmitter {
    config: IrHardwareConfig,
    sent_frames: u64,
    failed_frames: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IrDiagnostics {
    #[serde(rename = "txPin")]
    pub tx_pin: i32,
    #[serde(rename = "carrierHz")]
    pub carrier_hz: u32,
    #[serde(rename = "dutyCycle")]
    pub duty_cycle: f32,
    #[serde(rename = "sentFrames")]
    pub sent_frames: u64,
    #[serde(rename = "failedFrames")]
    pub failed_frames: u64,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

impl IrTransmitter {
    pub fn new(mut config: IrHardwareConfig) -> Self {
        config.sanitize();
        Self {
            config,
            sent_frames: 0,
            failed_frames: 0,
            last_error: None,
        }
    }

    pub fn diagnostics(&self) -> IrDiagnostics {
        IrDiagnostics {
            tx_pin: self.config.tx_pin,
            carrier_hz: self.config.carrier_hz,
            duty_cycle: self.config.duty_cycle,
            sent_frames: self.sent_frames,
            failed_frames: self.failed_frames,
            last_error: self.last_error.clone(),
        }
    }

    /// Replay `raw` mark/space timings, then leave the carrier off.
    ///
    /// A driver error does not cut the frame short: the remaining timings are
    /// still waited out so the pulse train keeps its shape, and the first error
    /// is returned afterwards.
    pub fn send_raw<H>(&mut self, hw: &mut H, raw: &[u16]) -> Result<u64, HalError>
    where
        H: CarrierOutput + Delay,
    {
        let IrHardwareConfig {
            tx_pin,
            carrier_hz,
            duty_cycle,
        } = self.config;

        let mut first_error = None;
        let mut elapsed_us = 0_u64;

        for (index, duration) in raw.iter().enumerate() {
            let duty = if index % 2 == 0 { duty_cycle } else { 0.0 };
            if let Err(err) = hw.set(tx_pin, carrier_hz, duty) {
                first_error.get_or_insert(err);
            }
            hw.delay_us(u32::from(*duration));
            elapsed_us += u64::from(*duration);
        }

        if let Err(err) = hw.set(tx_pin, carrier_hz, 0.0) {
            first_error.get_or_insert(err);
        }

        match first_error {
            Some(err) => {
                warn!("IR frame on GPIO{tx_pin} had driver errors: {err}");
                self.failed_frames = self.failed_frames.saturating_add(1);
                self.last_error = Some(err.to_string());
                Err(err)
            }
            None => {
                info!(
                    "sent IR frame: {} timings, {} us on GPIO{tx_pin}",
                    raw.len(),
                    elapsed_us
                );
                self.sent_frames = self.sent_frames.saturating_add(1);
                self.last_error = None;
                Ok(elapsed_us)
            }
        }
    }
}

/// Compare value for a PWM timer with `resolution_bits` of duty resolution.
///
/// The scale is `2^bits` steps so 0.5 lands exactly on half the period; full
/// duty saturates at the largest representable count.
pub fn duty_counts(duty: f32, resolution_bits: u32) -> u32 {
    let steps = 1_u32 << resolution_bits;
    let counts = (duty.clamp(0.0, 1.0) * steps as f32).round() as u32;
    counts.min(steps - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ir_codes::IR_RAW_SEND, mock::MockBoard};
    use pretty_assertions::assert_eq;

    struct FlakyCarrier {
        calls: usize,
        waited_us: u64,
    }

    impl CarrierOutput for FlakyCarrier {
        fn set(&mut self, _pin: i32, _frequency_hz: u32, _duty: f32) -> Result<(), HalError> {
            self.calls += 1;
            if self.calls == 2 {
                return Err(HalError::new("ledc", "duty update rejected"));
            }
            Ok(())
        }
    }

    impl Delay for FlakyCarrier {
        fn delay_us(&mut self, us: u32) {
            self.waited_us += u64::from(us);
        }
    }

    #[test]
    fn waits_exactly_the_table_sum_and_ends_off() {
        let mut board = MockBoard::default();
        let mut ir = IrTransmitter::new(IrHardwareConfig::default());

        let elapsed = ir.send_raw(&mut board, IR_RAW_SEND).unwrap();

        let expected: u64 = IR_RAW_SEND.iter().map(|d| u64::from(*d)).sum();
        assert_eq!(expected, 180_490);
        assert_eq!(elapsed, expected);
        assert_eq!(board.delayed_us, expected);

        let last = board.carrier.last().unwrap();
        assert_eq!(last.duty, 0.0);
        assert_eq!(last.at_us, expected);
        assert_eq!(board.carrier.len(), IR_RAW_SEND.len() + 1);
    }

    #[test]
    fn alternates_mark_and_space_in_table_order() {
        let mut board = MockBoard::default();
        let mut ir = IrTransmitter::new(IrHardwareConfig::default());

        ir.send_raw(&mut board, &[560, 1690, 560]).unwrap();

        let trace: Vec<(f32, u64)> = board.carrier.iter().map(|e| (e.duty, e.at_us)).collect();
        assert_eq!(
            trace,
            vec![(0.5, 0), (0.0, 560), (0.5, 2_250), (0.0, 2_810)]
        );
        assert!(board
            .carrier
            .iter()
            .all(|e| e.pin == 14 && e.frequency_hz == 38_000));
    }

    #[test]
    fn driver_error_keeps_frame_timing() {
        let mut carrier = FlakyCarrier {
            calls: 0,
            waited_us: 0,
        };
        let mut ir = IrTransmitter::new(IrHardwareConfig::default());

        let err = ir.send_raw(&mut carrier, &[100, 200, 300]).unwrap_err();

        assert_eq!(err.peripheral, "ledc");
        assert_eq!(carrier.calls, 4);
        assert_eq!(carrier.waited_us, 600);
        assert_eq!(ir.diagnostics().failed_frames, 1);
        assert_eq!(ir.diagnostics().sent_frames, 0);
    }

    #[test]
    fn half_duty_is_exactly_half_the_period() {
        assert_eq!(duty_counts(0.5, 8), 128);
        assert_eq!(duty_counts(0.25, 10), 256);
        assert_eq!(duty_counts(0.0, 8), 0);
        assert_eq!(duty_counts(1.0, 8), 255);
    }
}
