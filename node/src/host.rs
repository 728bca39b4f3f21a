use std::{
    collections::HashMap,
    f64::consts::TAU,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, ClientError, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, trace, warn};

use ambient_common::{
    ir::IrDiagnostics,
    onewire::{self, CMD_CONVERT_T, CMD_READ_SCRATCHPAD, CMD_WRITE_SCRATCHPAD},
    render_topic,
    temperature::ConversionState,
    Ack, LinkState, AnalogInput, Board, CarrierOutput, Clock, Command, Delay, DigitalOutput,
    HalError, Node, NodeConfig, OneWireBus, Qos, TaskSchedule, Transport, TransportError,
};

const IDLE_WAKE: Duration = Duration::from_secs(1);
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const REQUEST_QUEUE_DEPTH: usize = 16;

type HostNode = Node<SimulatedBoard, MqttTransport>;

enum NodeRequest {
    Command {
        command: Command,
        reply: Option<oneshot::Sender<Ack>>,
    },
    Status(oneshot::Sender<StatusView>),
}

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<NodeRequest>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    uptime: f64,
    brightness: i32,
    temperature: f32,
    #[serde(rename = "conversionPending")]
    conversion_pending: bool,
    #[serde(rename = "mqttConnected")]
    mqtt_connected: bool,
    #[serde(rename = "sensorTopic")]
    sensor_topic: String,
    ir: IrDiagnostics,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_config().await.context("failed to load node config")?;
    let command_topic = render_topic(&config.command_topic, &config.device_id)
        .context("failed to render command topic")?;

    let mut mqtt_options = MqttOptions::new(
        config.device_id.clone(),
        config.network.mqtt_host.clone(),
        config.network.mqtt_port,
    );
    if !config.network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(
            config.network.mqtt_user.clone(),
            config.network.mqtt_pass.clone(),
        );
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 32);
    let link = Arc::new(LinkState::new());

    let transport = MqttTransport {
        client: mqtt.clone(),
        link: link.clone(),
    };
    let mut node = Node::start(&config, SimulatedBoard::new(&config), transport)
        .context("node startup failed")?;

    let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);

    spawn_mqtt_loop(
        eventloop,
        mqtt,
        link,
        command_topic,
        requests_tx.clone(),
    );

    let app = Router::new()
        .route("/rpc/{method}", post(handle_rpc))
        .route("/api/status", get(handle_get_status))
        .with_state(AppState {
            requests: requests_tx,
        });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind command server at {addr}"))?;
    info!("command server listening on http://{addr}");
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("command server stopped: {err}");
        }
    });

    let schedule = TaskSchedule::new(&config.periods, node.board().uptime());
    run_scheduler(&mut node, schedule, requests_rx).await;
    Ok(())
}

/// Single cooperative loop: periodic tasks and inbound commands never overlap.
async fn run_scheduler(
    node: &mut HostNode,
    mut schedule: TaskSchedule,
    mut requests: mpsc::Receiver<NodeRequest>,
) {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let wake = node.board().started
            + schedule
                .next_deadline()
                .unwrap_or_else(|| node.board().uptime() + IDLE_WAKE);

        tokio::select! {
            _ = tokio::time::sleep_until(wake.into()) => {
                let now = node.board().uptime();
                for task in schedule.due(now) {
                    if let Err(err) = node.run_task(task) {
                        warn!("{task:?} failed: {err}");
                    }
                }
            }
            Some(request) = requests.recv() => handle_request(node, request),
            _ = &mut shutdown => {
                info!("shutting down");
                return;
            }
        }
    }
}

fn handle_request(node: &mut HostNode, request: NodeRequest) {
    match request {
        NodeRequest::Command { command, reply } => {
            info!("executing {}", command.as_str());
            // IR frames hold the carrier with blocking delays.
            let ack = tokio::task::block_in_place(|| node.handle(command));
            if let Some(reply) = reply {
                let _ = reply.send(ack);
            }
        }
        NodeRequest::Status(reply) => {
            let readings = node.readings();
            let _ = reply.send(StatusView {
                uptime: node.board().uptime().as_secs_f64(),
                brightness: readings.brightness,
                temperature: readings.temperature_c,
                conversion_pending: node.conversion_state() != ConversionState::Idle,
                mqtt_connected: node.transport().is_connected(),
                sensor_topic: node.sensor_topic().to_string(),
                ir: node.ir_diagnostics(),
            });
        }
    }
}

/// What the node does with one MQTT event-loop notification.
#[derive(Debug, PartialEq, Eq)]
enum LinkEvent {
    /// Broker accepted the session; the command subscription must be renewed.
    Connected,
    Disconnected,
    Command(Command),
    Ignored,
}

fn classify_event(event: &Event, command_topic: &str) -> LinkEvent {
    match event {
        Event::Incoming(Incoming::ConnAck(_)) => LinkEvent::Connected,
        Event::Incoming(Incoming::Disconnect) => LinkEvent::Disconnected,
        Event::Incoming(Incoming::Publish(message)) if message.topic == command_topic => {
            if message.payload.len() > MAX_MQTT_PAYLOAD_BYTES {
                warn!(
                    "dropping oversized command payload ({} bytes)",
                    message.payload.len()
                );
                return LinkEvent::Ignored;
            }
            match String::from_utf8_lossy(&message.payload).parse::<Command>() {
                Ok(command) => LinkEvent::Command(command),
                Err(err) => {
                    warn!("ignoring mqtt command: {err}");
                    LinkEvent::Ignored
                }
            }
        }
        _ => LinkEvent::Ignored,
    }
}

/// Clean sessions drop subscriptions on every reconnect.
fn subscribe_commands(client: &AsyncClient, command_topic: &str) -> Result<(), ClientError> {
    client.try_subscribe(command_topic, QoS::AtMostOnce)
}

fn spawn_mqtt_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    link: Arc<LinkState>,
    command_topic: String,
    requests: mpsc::Sender<NodeRequest>,
) {
    tokio::spawn(async move {
        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(err) => {
                    link.on_disconnected();
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            match classify_event(&event, &command_topic) {
                LinkEvent::Connected => {
                    link.on_connected();
                    info!("mqtt connected");
                    // rumqttc queues the request, so this cannot block the poll loop.
                    if link.take_resubscribe() {
                        if let Err(err) = subscribe_commands(&client, &command_topic) {
                            warn!("mqtt subscribe to `{command_topic}` failed: {err}");
                        }
                    }
                }
                LinkEvent::Disconnected => link.on_disconnected(),
                LinkEvent::Command(command) => {
                    let request = NodeRequest::Command {
                        command,
                        reply: None,
                    };
                    if requests.send(request).await.is_err() {
                        return;
                    }
                }
                LinkEvent::Ignored => {}
            }
        }
    });
}

async fn handle_rpc(
    State(state): State<AppState>,
    Path(method): Path<String>,
) -> axum::response::Response {
    let command = match method.parse::<Command>() {
        Ok(command) => command,
        Err(err) => return error_response(StatusCode::NOT_FOUND, &err.to_string()),
    };

    let (reply, response) = oneshot::channel();
    let request = NodeRequest::Command {
        command,
        reply: Some(reply),
    };
    if state.requests.send(request).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down");
    }

    match response.await {
        Ok(ack) => Json(ack).into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down"),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> axum::response::Response {
    let (reply, response) = oneshot::channel();
    if state.requests.send(NodeRequest::Status(reply)).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down");
    }

    match response.await {
        Ok(status) => Json(status).into_response(),
        Err(_) => error_response(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down"),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

async fn load_config() -> anyhow::Result<NodeConfig> {
    let path = std::env::var("AMBIENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.ambient/node.json"));

    let mut config = match tokio::fs::read(&path).await {
        Ok(raw) => serde_json::from_slice::<NodeConfig>(&raw)
            .with_context(|| format!("invalid config at {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("no config at {}, using defaults", path.display());
            NodeConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()))
        }
    };

    if let Ok(device_id) = std::env::var("DEVICE_ID") {
        config.device_id = device_id;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        config.network.mqtt_user = user;
        config.network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Some(port) = std::env::var("NODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.network.http_port = port;
    }

    config.sanitize();
    Ok(config)
}

struct MqttTransport {
    client: AsyncClient,
    link: Arc<LinkState>,
}

impl Transport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn publish(
        &mut self,
        topic: &str,
        qos: Qos,
        retain: bool,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload.to_vec())
            .map_err(|err| TransportError::Publish {
                topic: topic.to_string(),
                message: err.to_string(),
            })
    }
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Desktop stand-in for the node's peripherals.
///
/// The light level drifts on a slow sine, the DS18B20 emulation follows the real
/// command sequence (reset, skip ROM, convert / read / write scratchpad).
struct SimulatedBoard {
    started: Instant,
    levels: HashMap<i32, bool>,
    carrier_duty: f32,
    samples: u64,
    bus: SimulatedDs18b20,
}

impl SimulatedBoard {
    fn new(config: &NodeConfig) -> Self {
        debug!("simulated board pins: {:?}", config.pins);
        let started = Instant::now();
        Self {
            started,
            levels: HashMap::new(),
            carrier_duty: 0.0,
            samples: 0,
            bus: SimulatedDs18b20::new(started, crc_fault_interval()),
        }
    }
}

fn crc_fault_interval() -> Option<u64> {
    std::env::var("SIM_CRC_FAULT_EVERY")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|every| *every > 0)
}

impl AnalogInput for SimulatedBoard {
    fn enable(&mut self, channel: u8) -> Result<(), HalError> {
        debug!("adc channel {channel} enabled");
        Ok(())
    }

    fn read_analog(&mut self, _channel: u8) -> Result<i32, HalError> {
        self.samples = self.samples.wrapping_add(1);
        let phase = self.started.elapsed().as_secs_f64() / 120.0 * TAU;
        let jitter = (self.samples % 7) as f64 * 3.0;
        Ok((2_048.0 + 1_500.0 * phase.sin() + jitter) as i32)
    }
}

impl DigitalOutput for SimulatedBoard {
    fn set_output_mode(&mut self, pin: i32) -> Result<(), HalError> {
        self.levels.entry(pin).or_insert(false);
        Ok(())
    }

    fn write(&mut self, pin: i32, high: bool) -> Result<(), HalError> {
        match self.levels.get_mut(&pin) {
            Some(level) => {
                *level = high;
                Ok(())
            }
            None => Err(HalError::new("gpio", format!("GPIO{pin} is not an output"))),
        }
    }

    fn read_level(&mut self, pin: i32) -> Result<bool, HalError> {
        self.levels
            .get(&pin)
            .copied()
            .ok_or_else(|| HalError::new("gpio", format!("GPIO{pin} is not an output")))
    }
}

impl CarrierOutput for SimulatedBoard {
    fn set(&mut self, pin: i32, frequency_hz: u32, duty: f32) -> Result<(), HalError> {
        if duty != self.carrier_duty {
            trace!("GPIO{pin} carrier {frequency_hz} Hz duty {duty}");
        }
        self.carrier_duty = duty;
        Ok(())
    }
}

impl Clock for SimulatedBoard {
    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Delay for SimulatedBoard {
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(u64::from(us)));
    }
}

impl Board for SimulatedBoard {
    type Bus = SimulatedDs18b20;

    fn one_wire(&mut self) -> &mut SimulatedDs18b20 {
        &mut self.bus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BusPhase {
    Idle,
    RomCommand,
    FunctionCommand,
    WriteScratchpad(u8),
}

struct SimulatedDs18b20 {
    started: Instant,
    phase: BusPhase,
    registers: [u8; 3],
    converted_raw: i16,
    outgoing: Vec<u8>,
    readbacks: u64,
    crc_fault_every: Option<u64>,
}

impl SimulatedDs18b20 {
    fn new(started: Instant, crc_fault_every: Option<u64>) -> Self {
        Self {
            started,
            phase: BusPhase::Idle,
            registers: [0x4B, 0x46, 0x7F],
            converted_raw: 0x0550,
            outgoing: Vec::new(),
            readbacks: 0,
            crc_fault_every,
        }
    }

    fn ambient_raw(&self) -> i16 {
        let phase = self.started.elapsed().as_secs_f64() / 300.0 * TAU;
        let celsius = 22.5 + 1.5 * phase.sin();
        (celsius * 16.0).round() as i16
    }

    fn scratchpad(&mut self) -> Vec<u8> {
        let [lsb, msb] = self.converted_raw.to_le_bytes();
        let [th, tl, config] = self.registers;
        let mut pad = onewire::seal_scratchpad([lsb, msb, th, tl, config, 0xFF, 0x0C, 0x10]);

        self.readbacks = self.readbacks.wrapping_add(1);
        if let Some(every) = self.crc_fault_every {
            if self.readbacks % every == 0 {
                pad.0[0] ^= 0x01;
            }
        }
        // Bytes are popped from the back.
        pad.0.iter().rev().copied().collect()
    }
}

impl OneWireBus for SimulatedDs18b20 {
    fn reset(&mut self) -> Result<bool, HalError> {
        self.phase = BusPhase::RomCommand;
        self.outgoing.clear();
        Ok(true)
    }

    fn skip_address(&mut self) -> Result<(), HalError> {
        if self.phase != BusPhase::RomCommand {
            return Err(HalError::new("onewire", "skip ROM without reset"));
        }
        self.phase = BusPhase::FunctionCommand;
        Ok(())
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), HalError> {
        match self.phase {
            BusPhase::FunctionCommand => match byte {
                CMD_CONVERT_T => {
                    self.converted_raw = self.ambient_raw();
                    self.phase = BusPhase::Idle;
                }
                CMD_READ_SCRATCHPAD => {
                    self.outgoing = self.scratchpad();
                    self.phase = BusPhase::Idle;
                }
                CMD_WRITE_SCRATCHPAD => self.phase = BusPhase::WriteScratchpad(0),
                other => {
                    return Err(HalError::new(
                        "onewire",
                        format!("unsupported function command {other:#04x}"),
                    ))
                }
            },
            BusPhase::WriteScratchpad(index) => {
                self.registers[usize::from(index)] = byte;
                self.phase = if index == 2 {
                    BusPhase::Idle
                } else {
                    BusPhase::WriteScratchpad(index + 1)
                };
            }
            BusPhase::Idle | BusPhase::RomCommand => {
                return Err(HalError::new("onewire", "write outside a transaction"));
            }
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, HalError> {
        Ok(self.outgoing.pop().unwrap_or(0xFF))
    }
}
