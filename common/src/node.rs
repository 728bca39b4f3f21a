use log::{info, warn};

use crate::{
    actuator::ActuatorSwitch,
    brightness::BrightnessSampler,
    command::{Ack, Command},
    config::{NodeConfig, PinConfig},
    error::{StartupError, TaskError},
    hal::Board,
    ir::{IrDiagnostics, IrTransmitter},
    ir_codes,
    onewire,
    schedule::NodeTask,
    telemetry::{PublishOutcome, TelemetryPublisher, TelemetryReading, Transport},
    temperature::{ConversionState, ReceiveOutcome, RequestOutcome, TemperatureSampler},
    topics::render_topic,
};

/// Latest filtered values shared between the acquisition and publish tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    pub brightness: i32,
    pub temperature_c: f32,
}

/// All process-lifetime state of the node.
///
/// Every task and command takes `&mut self`, so callers that drive the node
/// from a single scheduler never need locks.
pub struct Node<H: Board, T: Transport> {
    board: H,
    transport: T,
    pins: PinConfig,
    brightness: BrightnessSampler,
    temperature: TemperatureSampler,
    readings: Readings,
    publisher: TelemetryPublisher,
    ir: IrTransmitter,
    ir_code: &'static [u16],
    actuator: ActuatorSwitch,
}

impl<H: Board, T: Transport> Node<H, T> {
    /// Bring up outputs and sensors, then render the telemetry topic.
    ///
    /// Output and ADC setup failures abort startup. A missing temperature
    /// sensor only logs: the acquisition tasks report it on every cycle.
    pub fn start(config: &NodeConfig, mut board: H, transport: T) -> Result<Self, StartupError> {
        let mut config = config.clone();
        config.sanitize();
        let pins = config.pins.clone();

        board.set_output_mode(pins.pilot_led)?;
        board.write(pins.pilot_led, true)?;

        let actuator = ActuatorSwitch::new(pins.actuator);
        actuator.init(&mut board)?;

        board.enable(pins.brightness_channel)?;

        if let Err(err) = onewire::configure_sensor(board.one_wire()) {
            warn!(
                "temperature sensor setup on GPIO{} failed: {err}",
                pins.temperature
            );
        }

        let topic = render_topic(&config.sensor_topic, &config.device_id)?;
        info!("publishing telemetry to `{topic}`");

        Ok(Self {
            board,
            transport,
            brightness: BrightnessSampler::new(pins.brightness_channel),
            temperature: TemperatureSampler::new(),
            readings: Readings::default(),
            publisher: TelemetryPublisher::new(topic),
            ir: IrTransmitter::new(config.ir),
            ir_code: ir_codes::IR_RAW_SEND,
            actuator,
            pins,
        })
    }

    pub fn run_task(&mut self, task: NodeTask) -> Result<(), TaskError> {
        match task {
            NodeTask::SampleBrightness => self.sample_brightness().map(|_| ()),
            NodeTask::RequestTemperature => self.request_temperature().map(|_| ()),
            NodeTask::ReceiveTemperature => self.receive_temperature().map(|_| ()),
            NodeTask::PublishTelemetry => self.publish_telemetry().map(|_| ()),
        }
    }

    pub fn sample_brightness(&mut self) -> Result<i32, TaskError> {
        let mean = self.brightness.sample(&mut self.board)?;
        self.readings.brightness = mean;
        Ok(mean)
    }

    pub fn request_temperature(&mut self) -> Result<RequestOutcome, TaskError> {
        let now = self.board.uptime();
        Ok(self.temperature.request(self.board.one_wire(), now)?)
    }

    pub fn receive_temperature(&mut self) -> Result<ReceiveOutcome, TaskError> {
        let now = self.board.uptime();
        let outcome = self.temperature.receive(self.board.one_wire(), now);
        self.readings.temperature_c = self.temperature.mean_c();
        Ok(outcome?)
    }

    pub fn publish_telemetry(&mut self) -> Result<PublishOutcome, TaskError> {
        let reading = TelemetryReading {
            uptime: self.board.uptime(),
            brightness: self.readings.brightness,
            temperature_c: self.readings.temperature_c,
        };
        Ok(self.publisher.publish(&mut self.transport, &reading)?)
    }

    /// Execute an inbound command. Commands always acknowledge; driver faults
    /// are logged.
    pub fn handle(&mut self, command: Command) -> Ack {
        match command {
            Command::SendIr => {
                if let Err(err) = self.ir.send_raw(&mut self.board, self.ir_code) {
                    warn!("SendIR completed with driver error: {err}");
                }
            }
            Command::ToggleActuator => {
                if let Err(err) = self.actuator.toggle(&mut self.board) {
                    warn!(
                        "ToggleActuator on GPIO{} failed: {err}",
                        self.pins.actuator
                    );
                }
            }
        }
        Ack::default()
    }

    pub fn readings(&self) -> Readings {
        self.readings
    }

    pub fn conversion_state(&self) -> ConversionState {
        self.temperature.state()
    }

    pub fn sensor_topic(&self) -> &str {
        self.publisher.topic()
    }

    pub fn ir_diagnostics(&self) -> IrDiagnostics {
        self.ir.diagnostics()
    }

    pub fn board(&self) -> &H {
        &self.board
    }

    pub fn board_mut(&mut self) -> &mut H {
        &mut self.board
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        error::{ConfigError, SensorError},
        mock::{MockBoard, MockTransport},
        onewire::{seal_scratchpad, CMD_WRITE_SCRATCHPAD, CONFIG_12_BIT},
        schedule::TaskSchedule,
    };
    use pretty_assertions::assert_eq;

    const POR_85C: [u8; 8] = [0x50, 0x05, 0x00, 0x00, 0x7F, 0xFF, 0x0C, 0x10];

    fn started() -> Node<MockBoard, MockTransport> {
        Node::start(
            &NodeConfig::default(),
            MockBoard::default(),
            MockTransport::default(),
        )
        .unwrap()
    }

    #[test]
    fn startup_sets_outputs_and_configures_sensor() {
        let node = started();
        let board = node.board();

        assert_eq!(board.output_pins, vec![2, 5]);
        assert_eq!(board.levels.get(&2), Some(&true));
        assert_eq!(board.levels.get(&5), Some(&false));
        assert_eq!(board.enabled_channels, vec![36]);
        assert_eq!(
            board.bus.written,
            vec![CMD_WRITE_SCRATCHPAD, 0x00, 0x00, CONFIG_12_BIT]
        );
        assert_eq!(board.bus.resets, 2);
        assert_eq!(node.sensor_topic(), "devices/ambient-node/sensors");
    }

    #[test]
    fn startup_fails_on_bad_topic_template() {
        let config = NodeConfig {
            sensor_topic: "devices/%d".to_string(),
            ..NodeConfig::default()
        };

        let err = Node::start(&config, MockBoard::default(), MockTransport::default())
            .err()
            .unwrap();

        assert!(matches!(
            err,
            StartupError::Config(ConfigError::UnsupportedConversion { .. })
        ));
    }

    #[test]
    fn startup_tolerates_absent_sensor() {
        let mut board = MockBoard::default();
        board.bus.present = false;

        let mut node = Node::start(&NodeConfig::default(), board, MockTransport::default())
            .unwrap();

        assert_eq!(
            node.request_temperature(),
            Err(TaskError::Sensor(SensorError::NoPresence))
        );
    }

    #[test]
    fn scheduled_cycle_publishes_filtered_values() {
        let mut node = started();
        node.transport_mut().connected = true;
        node.board_mut().analog.extend([800; 5]);
        node.board_mut().bus.queue_scratchpad(seal_scratchpad(POR_85C));

        let mut schedule = TaskSchedule::new(&crate::config::TaskPeriods::default(), Duration::ZERO);
        for tick in 1..=10_u64 {
            let now = Duration::from_millis(tick * 100);
            node.board_mut().now = now;
            for task in schedule.due(now) {
                let _ = node.run_task(task);
            }
        }

        // Five brightness samples of 800 and one 85 °C conversion by t = 1 s.
        assert_eq!(
            node.readings(),
            Readings {
                brightness: 400,
                temperature_c: 8.5,
            }
        );
        let published = &node.transport().published;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "devices/ambient-node/sensors");
        assert_eq!(published[0].payload, "1.00 400 8.50");
    }

    #[test]
    fn disconnected_publish_leaves_filters_untouched() {
        let mut node = started();
        node.board_mut().analog.push_back(1_000);
        node.sample_brightness().unwrap();
        let before = node.readings();

        let outcome = node.publish_telemetry().unwrap();

        assert_eq!(outcome, PublishOutcome::Skipped);
        assert!(node.transport().published.is_empty());
        assert_eq!(node.readings(), before);
    }

    #[test]
    fn send_ir_blocks_for_frame_and_acknowledges() {
        let mut node = started();

        let ack = node.handle(Command::SendIr);

        assert_eq!(ack, Ack::default());
        assert_eq!(node.board().delayed_us, 180_490);
        assert_eq!(node.board().carrier.last().map(|e| e.duty), Some(0.0));
        assert_eq!(node.ir_diagnostics().sent_frames, 1);
    }

    #[test]
    fn toggle_twice_restores_actuator() {
        let mut node = started();
        let initial = node.board().levels.get(&5).copied();

        node.handle(Command::ToggleActuator);
        assert_eq!(node.board().levels.get(&5), Some(&true));
        node.handle(Command::ToggleActuator);

        assert_eq!(node.board().levels.get(&5).copied(), initial);
    }
}
