//! Split-phase DS18B20 acquisition.
//!
//! A conversion takes up to 750 ms at 12-bit resolution. Instead of sleeping
//! through it, [`TemperatureSampler::request`] starts a conversion and
//! [`TemperatureSampler::receive`] collects it on a later tick once the latency
//! has elapsed. Both run from the same periodic schedule.

use std::time::Duration;

use log::{debug, info};

use crate::{
    error::SensorError,
    filter::MovingAverage,
    hal::OneWireBus,
    onewire::{self, CMD_CONVERT_T},
};

/// Worst-case 12-bit conversion time from the DS18B20 datasheet.
pub const CONVERSION_LATENCY: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    Idle,
    Waiting { issued_at: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestOutcome {
    Issued,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReceiveOutcome {
    NothingPending,
    NotReady,
    Updated { sample_c: f32, mean_c: f32 },
}

#[derive(Debug, Clone)]
pub struct TemperatureSampler {
    state: ConversionState,
    history: MovingAverage<f32>,
}

impl TemperatureSampler {
    pub fn new() -> Self {
        Self {
            state: ConversionState::Idle,
            history: MovingAverage::new(),
        }
    }

    pub fn state(&self) -> ConversionState {
        self.state
    }

    pub fn mean_c(&self) -> f32 {
        self.history.mean()
    }

    pub fn request<B: OneWireBus>(
        &mut self,
        bus: &mut B,
        now: Duration,
    ) -> Result<RequestOutcome, SensorError> {
        if let ConversionState::Waiting { .. } = self.state {
            return Ok(RequestOutcome::InFlight);
        }

        onewire::select_all(bus)?;
        onewire::write_all(bus, &[CMD_CONVERT_T])?;
        self.state = ConversionState::Waiting { issued_at: now };

        debug!("requested temperature conversion at {:.2}s", now.as_secs_f64());
        Ok(RequestOutcome::Issued)
    }

    /// Collect a finished conversion.
    ///
    /// Any readback attempt, successful or not, returns the machine to `Idle`.
    /// On a CRC or bus fault the sample is dropped and the previous mean stays.
    pub fn receive<B: OneWireBus>(
        &mut self,
        bus: &mut B,
        now: Duration,
    ) -> Result<ReceiveOutcome, SensorError> {
        let issued_at = match self.state {
            ConversionState::Idle => return Ok(ReceiveOutcome::NothingPending),
            ConversionState::Waiting { issued_at } => issued_at,
        };

        if now.saturating_sub(issued_at) < CONVERSION_LATENCY {
            return Ok(ReceiveOutcome::NotReady);
        }

        let readback = onewire::read_scratchpad(bus).and_then(|pad| {
            pad.validate()?;
            Ok(pad.celsius())
        });
        self.state = ConversionState::Idle;

        let sample_c = readback?;
        self.history.push(sample_c);
        let mean_c = self.history.mean();
        info!("updated temperature: {sample_c:.2}°C (mean {mean_c:.2}°C)");
        Ok(ReceiveOutcome::Updated { sample_c, mean_c })
    }
}

impl Default for TemperatureSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::MockBus,
        onewire::{seal_scratchpad, CMD_READ_SCRATCHPAD},
    };
    use pretty_assertions::assert_eq;

    const POR_85C: [u8; 8] = [0x50, 0x05, 0x00, 0x00, 0x7F, 0xFF, 0x0C, 0x10];

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn request_issues_convert_and_waits() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();

        let outcome = sampler.request(&mut bus, ms(200)).unwrap();

        assert_eq!(outcome, RequestOutcome::Issued);
        assert_eq!(bus.resets, 1);
        assert_eq!(bus.skips, 1);
        assert_eq!(bus.written, vec![CMD_CONVERT_T]);
        assert_eq!(
            sampler.state(),
            ConversionState::Waiting { issued_at: ms(200) }
        );
    }

    #[test]
    fn never_issues_second_conversion_while_waiting() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();
        bus.queue_scratchpad(seal_scratchpad(POR_85C));

        let mut issued = 0;
        for tick in 0..20_u64 {
            let now = ms(tick * 200);
            if sampler.request(&mut bus, now).unwrap() == RequestOutcome::Issued {
                issued += 1;
                // The conversion just issued must still be the only one outstanding.
                assert_eq!(sampler.state(), ConversionState::Waiting { issued_at: now });
            }
            let _ = sampler.receive(&mut bus, now);
        }

        let converts = bus.written.iter().filter(|b| **b == CMD_CONVERT_T).count();
        assert_eq!(converts, issued);
        // Issue at 0 ms, collect at 800 ms, reissue at 1000 ms: one per second.
        assert_eq!(issued, 4);
    }

    fn conversion_ended(outcome: &Result<ReceiveOutcome, SensorError>) -> bool {
        !matches!(
            outcome,
            Ok(ReceiveOutcome::NotReady | ReceiveOutcome::NothingPending)
        )
    }

    #[test]
    fn one_convert_per_wait_in_any_task_order() {
        // Empty reads float high, so every readback fails CRC and ends the wait.
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();
        let mut issued = 0;
        let mut ended = 0;

        for tick in 0..40_u64 {
            let now = ms(tick * 100);
            let receive_first = tick % 3 != 0;

            if receive_first && conversion_ended(&sampler.receive(&mut bus, now)) {
                ended += 1;
            }
            for burst in 0..3 {
                let was_idle = sampler.state() == ConversionState::Idle;
                match sampler.request(&mut bus, now + ms(burst)).unwrap() {
                    RequestOutcome::Issued => {
                        assert!(was_idle);
                        issued += 1;
                    }
                    RequestOutcome::InFlight => assert!(!was_idle),
                }
            }
            if !receive_first && conversion_ended(&sampler.receive(&mut bus, now)) {
                ended += 1;
            }

            assert!(issued - ended <= 1);
        }

        let converts = bus.written.iter().filter(|b| **b == CMD_CONVERT_T).count();
        assert_eq!(converts, issued);
        assert!(issued >= 4);
    }

    #[test]
    fn receive_is_noop_before_latency() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();
        sampler.request(&mut bus, ms(1_000)).unwrap();
        let before = bus.clone();

        let outcome = sampler.receive(&mut bus, ms(1_749)).unwrap();

        assert_eq!(outcome, ReceiveOutcome::NotReady);
        assert_eq!(bus, before);
        assert_eq!(sampler.mean_c(), 0.0);
        assert_eq!(
            sampler.state(),
            ConversionState::Waiting { issued_at: ms(1_000) }
        );
    }

    #[test]
    fn receive_without_request_does_nothing() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();

        let outcome = sampler.receive(&mut bus, ms(5_000)).unwrap();

        assert_eq!(outcome, ReceiveOutcome::NothingPending);
        assert_eq!(bus.resets, 0);
    }

    #[test]
    fn valid_scratchpad_feeds_filter() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();
        bus.queue_scratchpad(seal_scratchpad(POR_85C));
        sampler.request(&mut bus, ms(0)).unwrap();

        let outcome = sampler.receive(&mut bus, ms(750)).unwrap();

        assert_eq!(
            outcome,
            ReceiveOutcome::Updated {
                sample_c: 85.0,
                mean_c: 8.5
            }
        );
        assert_eq!(bus.written, vec![CMD_CONVERT_T, CMD_READ_SCRATCHPAD]);
        assert_eq!(sampler.state(), ConversionState::Idle);
    }

    #[test]
    fn crc_failure_keeps_stale_mean_and_clears_state() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();

        bus.queue_scratchpad(seal_scratchpad(POR_85C));
        sampler.request(&mut bus, ms(0)).unwrap();
        sampler.receive(&mut bus, ms(800)).unwrap();
        let stale = sampler.mean_c();

        let mut corrupted = seal_scratchpad(POR_85C);
        corrupted.0[0] = 0x40;
        bus.queue_scratchpad(corrupted);
        sampler.request(&mut bus, ms(1_000)).unwrap();
        let err = sampler.receive(&mut bus, ms(1_800)).unwrap_err();

        assert!(matches!(err, SensorError::Crc { .. }));
        assert_eq!(sampler.mean_c(), stale);
        assert_eq!(sampler.state(), ConversionState::Idle);
        assert_eq!(
            sampler.request(&mut bus, ms(2_000)).unwrap(),
            RequestOutcome::Issued
        );
    }

    #[test]
    fn missing_presence_on_request_stays_idle() {
        let mut bus = MockBus {
            present: false,
            ..MockBus::default()
        };
        let mut sampler = TemperatureSampler::new();

        let err = sampler.request(&mut bus, ms(0)).unwrap_err();

        assert_eq!(err, SensorError::NoPresence);
        assert_eq!(sampler.state(), ConversionState::Idle);
        assert!(bus.written.is_empty());
    }

    #[test]
    fn bus_fault_during_readback_ends_conversion() {
        let mut bus = MockBus::default();
        let mut sampler = TemperatureSampler::new();
        sampler.request(&mut bus, ms(0)).unwrap();
        bus.fail_reads = true;

        let err = sampler.receive(&mut bus, ms(1_000)).unwrap_err();

        assert!(matches!(err, SensorError::Bus(_)));
        assert_eq!(sampler.state(), ConversionState::Idle);
        assert_eq!(sampler.mean_c(), 0.0);
    }
}
