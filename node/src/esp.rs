use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::Write,
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::{self, esp},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::OneWire;
use serde::Serialize;

use ambient_common::{
    command::RPC_NAMESPACE,
    ir::duty_counts,
    render_topic, Ack, AnalogInput, Board, CarrierOutput, Clock, Command, Delay, DigitalOutput,
    HalError, LinkState, Node, NodeConfig, OneWireBus, Qos, TaskSchedule, Transport,
    TransportError,
};

const NVS_NAMESPACE: &str = "ambient";
const NVS_CONFIG_KEY: &str = "node_json";

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const SCHEDULER_TICK: Duration = Duration::from_millis(10);
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

const CARRIER_SPEED_MODE: sys::ledc_mode_t = sys::ledc_mode_t_LEDC_LOW_SPEED_MODE;
const CARRIER_TIMER: sys::ledc_timer_t = sys::ledc_timer_t_LEDC_TIMER_0;
const CARRIER_CHANNEL: sys::ledc_channel_t = sys::ledc_channel_t_LEDC_CHANNEL_0;
const CARRIER_DUTY_BITS: u32 = 8;

type EspNode = Node<EspBoard, EspMqttTransport>;

struct CommandRequest {
    command: Command,
    reply: Option<mpsc::Sender<Ack>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub fn run() -> anyhow::Result<()> {
    sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load node config from NVS: {err:#}");
        NodeConfig::default()
    });
    if config.device_id == NodeConfig::default().device_id {
        config.device_id = device_id_from_mac();
    }
    config.sanitize();
    info!(
        "node `{}` config loaded: ssid=`{}`, mqtt=`{}:{}`",
        config.device_id,
        config.network.wifi_ssid,
        config.network.mqtt_host,
        config.network.mqtt_port,
    );

    let board = EspBoard::new(&config).context("board init failed")?;

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &config)
        .context("wifi startup failed")?;

    let command_topic = render_topic(&config.command_topic, &config.device_id)?;
    let (commands_tx, commands_rx) = mpsc::channel::<CommandRequest>();

    let (client, conn) = create_mqtt_client(&config)?;
    let client = Arc::new(Mutex::new(client));
    let link = Arc::new(LinkState::new());
    spawn_mqtt_receiver(conn, link.clone(), command_topic.clone(), commands_tx.clone());

    let transport = EspMqttTransport {
        client: client.clone(),
        link: link.clone(),
    };
    let mut node = Node::start(&config, board, transport).context("node startup failed")?;

    let server = create_http_server(config.network.http_port, commands_tx)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    let mut schedule = TaskSchedule::new(&config.periods, node.board().uptime());
    loop {
        if link.take_resubscribe() {
            if let Err(err) = subscribe_commands(&client, &command_topic) {
                warn!("mqtt subscribe to `{command_topic}` failed: {err:#}");
                link.retry_resubscribe();
            }
        }

        let now = node.board().uptime();
        for task in schedule.due(now) {
            if let Err(err) = node.run_task(task) {
                warn!("{task:?} failed: {err}");
            }
        }

        while let Ok(request) = commands_rx.try_recv() {
            execute_command(&mut node, request);
        }

        thread::sleep(SCHEDULER_TICK);
    }
}

fn execute_command(node: &mut EspNode, request: CommandRequest) {
    info!("executing {}", request.command.as_str());
    let ack = node.handle(request.command);
    if let Some(reply) = request.reply {
        let _ = reply.send(ack);
    }
}

fn load_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<NodeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 2048];

    match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<NodeConfig>(value)?),
        None => Ok(NodeConfig::default()),
    }
}

fn device_id_from_mac() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe { sys::esp_read_mac(mac.as_mut_ptr(), sys::esp_mac_type_t_ESP_MAC_WIFI_STA) };
    if rc != sys::ESP_OK {
        warn!("failed to read station MAC: esp_err_t={rc}");
        return NodeConfig::default().device_id;
    }
    format!("esp32_{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5])
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    config: &NodeConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let network = &config.network;
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("wifi ssid is not configured"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
                let _ = wifi.disconnect();
                thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
            }
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(err).context("wifi connect attempts exhausted"));
    }
    Ok(esp_wifi)
}

fn create_mqtt_client(
    config: &NodeConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let network = &config.network;
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(config.device_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

/// Runs on the scheduler thread, never inside a connection event.
fn subscribe_commands(
    client: &Mutex<EspMqttClient<'static>>,
    command_topic: &str,
) -> anyhow::Result<()> {
    let mut client = client
        .lock()
        .map_err(|_| anyhow!("mqtt client lock poisoned"))?;
    client.subscribe(command_topic, QoS::AtMostOnce)?;
    info!("subscribed to `{command_topic}`");
    Ok(())
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    link: Arc<LinkState>,
    command_topic: String,
    commands: mpsc::Sender<CommandRequest>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        link.on_connected();
                        info!("mqtt connected");
                    }
                    EventPayload::Disconnected => {
                        link.on_disconnected();
                        warn!("mqtt disconnected");
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if topic != command_topic || !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!("dropping oversized command payload ({} bytes)", data.len());
                            continue;
                        }
                        let method = String::from_utf8_lossy(data);
                        match method.parse::<Command>() {
                            Ok(command) => {
                                let _ = commands.send(CommandRequest {
                                    command,
                                    reply: None,
                                });
                            }
                            Err(err) => warn!("ignoring mqtt command: {err}"),
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    link.on_disconnected();
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn create_http_server(
    port: u16,
    commands: mpsc::Sender<CommandRequest>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port: port,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for command in [Command::SendIr, Command::ToggleActuator] {
        let mut names = vec![command.as_str().to_string()];
        if command == Command::ToggleActuator {
            names.push("ToggleSSR".to_string());
        }
        let routes: Vec<String> = names
            .iter()
            .flat_map(|name| [format!("/rpc/{name}"), format!("/rpc/{RPC_NAMESPACE}.{name}")])
            .collect();

        for route in routes {
            let commands = commands.clone();
            server.fn_handler::<anyhow::Error, _>(&route, Method::Post, move |req| {
                let (reply, ack) = mpsc::channel();
                let sent = commands.send(CommandRequest {
                    command,
                    reply: Some(reply),
                });

                let answered = sent
                    .ok()
                    .and_then(|()| ack.recv_timeout(COMMAND_REPLY_TIMEOUT).ok());
                let (status, body) = match answered {
                    Some(ack) => (200, serde_json::to_vec(&ack)?),
                    None => (
                        503,
                        serde_json::to_vec(&ErrorBody {
                            error: "node did not answer",
                        })?,
                    ),
                };

                req.into_response(
                    status,
                    None,
                    &[("Content-Type", "application/json; charset=utf-8")],
                )?
                .write_all(&body)?;
                Ok(())
            })?;
        }
    }

    Ok(server)
}

struct EspMqttTransport {
    client: Arc<Mutex<EspMqttClient<'static>>>,
    link: Arc<LinkState>,
}

impl Transport for EspMqttTransport {
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
        let failed = |message: String| TransportError::Publish {
            topic: topic.to_string(),
            message,
        };

        let mut client = self
            .client
            .lock()
            .map_err(|_| failed("mqtt client lock poisoned".to_string()))?;
        client
            .enqueue(topic, to_mqtt_qos(qos), retain, payload)
            .map(|_| ())
            .map_err(|err| failed(err.to_string()))
    }
}

fn to_mqtt_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

fn esp_hal_error(peripheral: &'static str, err: sys::EspError) -> HalError {
    HalError::new(peripheral, err.to_string())
}

struct EspOneWire {
    bus: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    delay: Ets,
}

impl OneWireBus for EspOneWire {
    fn reset(&mut self) -> Result<bool, HalError> {
        self.bus
            .reset(&mut self.delay)
            .map_err(|err| HalError::new("onewire", format!("reset failed: {err:?}")))
    }

    fn skip_address(&mut self) -> Result<(), HalError> {
        self.bus
            .skip_address(&mut self.delay)
            .map_err(|err| HalError::new("onewire", format!("skip ROM failed: {err:?}")))
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), HalError> {
        self.bus
            .write_byte(byte, &mut self.delay)
            .map_err(|err| HalError::new("onewire", format!("write failed: {err:?}")))
    }

    fn read_byte(&mut self) -> Result<u8, HalError> {
        self.bus
            .read_byte(&mut self.delay)
            .map_err(|err| HalError::new("onewire", format!("read failed: {err:?}")))
    }
}

/// ESP32 peripherals behind the node's hardware traits.
///
/// GPIOs come from the runtime pin map, so drivers are built from raw pin
/// numbers. The ADC and LEDC carrier go through the IDF C drivers directly.
struct EspBoard {
    started: Instant,
    outputs: HashMap<i32, PinDriver<'static, AnyOutputPin, Output>>,
    adc_unit: sys::adc_oneshot_unit_handle_t,
    adc_channels: HashMap<u8, sys::adc_channel_t>,
    carrier_pin: Option<i32>,
    carrier_hz: u32,
    bus: EspOneWire,
}

impl EspBoard {
    fn new(config: &NodeConfig) -> anyhow::Result<Self> {
        let mut one_wire_pin =
            PinDriver::input_output_od(unsafe { AnyIOPin::new(config.pins.temperature) })?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;
        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        Ok(Self {
            started: Instant::now(),
            outputs: HashMap::new(),
            adc_unit: core::ptr::null_mut(),
            adc_channels: HashMap::new(),
            carrier_pin: None,
            carrier_hz: config.ir.carrier_hz,
            bus: EspOneWire {
                bus: one_wire,
                delay: Ets,
            },
        })
    }

    fn ensure_carrier(&mut self, pin: i32, frequency_hz: u32) -> Result<(), HalError> {
        if self.carrier_pin == Some(pin) {
            if self.carrier_hz != frequency_hz {
                esp!(unsafe { sys::ledc_set_freq(CARRIER_SPEED_MODE, CARRIER_TIMER, frequency_hz) })
                    .map_err(|err| esp_hal_error("ledc", err))?;
                self.carrier_hz = frequency_hz;
            }
            return Ok(());
        }

        let timer = sys::ledc_timer_config_t {
            speed_mode: CARRIER_SPEED_MODE,
            duty_resolution: CARRIER_DUTY_BITS,
            timer_num: CARRIER_TIMER,
            freq_hz: frequency_hz,
            ..Default::default()
        };
        esp!(unsafe { sys::ledc_timer_config(&timer) }).map_err(|err| esp_hal_error("ledc", err))?;

        let channel = sys::ledc_channel_config_t {
            gpio_num: pin,
            speed_mode: CARRIER_SPEED_MODE,
            channel: CARRIER_CHANNEL,
            timer_sel: CARRIER_TIMER,
            duty: 0,
            hpoint: 0,
            ..Default::default()
        };
        esp!(unsafe { sys::ledc_channel_config(&channel) })
            .map_err(|err| esp_hal_error("ledc", err))?;

        info!("IR carrier on GPIO{pin} @ {frequency_hz} Hz");
        self.carrier_pin = Some(pin);
        self.carrier_hz = frequency_hz;
        Ok(())
    }
}

impl AnalogInput for EspBoard {
    fn enable(&mut self, channel: u8) -> Result<(), HalError> {
        let mut unit_id: sys::adc_unit_t = 0;
        let mut adc_channel: sys::adc_channel_t = 0;
        esp!(unsafe {
            sys::adc_oneshot_io_to_channel(i32::from(channel), &mut unit_id, &mut adc_channel)
        })
        .map_err(|err| esp_hal_error("adc", err))?;

        if unit_id != sys::adc_unit_t_ADC_UNIT_1 {
            return Err(HalError::new(
                "adc",
                format!("GPIO{channel} is not on ADC1 (unusable with wifi)"),
            ));
        }

        if self.adc_unit.is_null() {
            let unit_cfg = sys::adc_oneshot_unit_init_cfg_t {
                unit_id,
                ..Default::default()
            };
            esp!(unsafe { sys::adc_oneshot_new_unit(&unit_cfg, &mut self.adc_unit) })
                .map_err(|err| esp_hal_error("adc", err))?;
        }

        let chan_cfg = sys::adc_oneshot_chan_cfg_t {
            atten: sys::adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: sys::adc_bitwidth_t_ADC_BITWIDTH_DEFAULT,
        };
        esp!(unsafe { sys::adc_oneshot_config_channel(self.adc_unit, adc_channel, &chan_cfg) })
            .map_err(|err| esp_hal_error("adc", err))?;

        self.adc_channels.insert(channel, adc_channel);
        Ok(())
    }

    fn read_analog(&mut self, channel: u8) -> Result<i32, HalError> {
        let adc_channel = *self
            .adc_channels
            .get(&channel)
            .ok_or_else(|| HalError::new("adc", format!("GPIO{channel} is not enabled")))?;

        let mut raw = 0;
        esp!(unsafe { sys::adc_oneshot_read(self.adc_unit, adc_channel, &mut raw) })
            .map_err(|err| esp_hal_error("adc", err))?;
        Ok(raw)
    }
}

impl DigitalOutput for EspBoard {
    fn set_output_mode(&mut self, pin: i32) -> Result<(), HalError> {
        if self.outputs.contains_key(&pin) {
            return Ok(());
        }
        let driver = PinDriver::output(unsafe { AnyOutputPin::new(pin) })
            .map_err(|err| esp_hal_error("gpio", err))?;
        self.outputs.insert(pin, driver);
        Ok(())
    }

    fn write(&mut self, pin: i32, high: bool) -> Result<(), HalError> {
        let driver = self
            .outputs
            .get_mut(&pin)
            .ok_or_else(|| HalError::new("gpio", format!("GPIO{pin} is not an output")))?;
        let result = if high {
            driver.set_high()
        } else {
            driver.set_low()
        };
        result.map_err(|err| esp_hal_error("gpio", err))
    }

    fn read_level(&mut self, pin: i32) -> Result<bool, HalError> {
        self.outputs
            .get(&pin)
            .map(|driver| driver.is_set_high())
            .ok_or_else(|| HalError::new("gpio", format!("GPIO{pin} is not an output")))
    }
}

impl CarrierOutput for EspBoard {
    fn set(&mut self, pin: i32, frequency_hz: u32, duty: f32) -> Result<(), HalError> {
        self.ensure_carrier(pin, frequency_hz)?;

        let duty = duty_counts(duty, CARRIER_DUTY_BITS);
        esp!(unsafe { sys::ledc_set_duty(CARRIER_SPEED_MODE, CARRIER_CHANNEL, duty) })
            .map_err(|err| esp_hal_error("ledc", err))?;
        esp!(unsafe { sys::ledc_update_duty(CARRIER_SPEED_MODE, CARRIER_CHANNEL) })
            .map_err(|err| esp_hal_error("ledc", err))
    }
}

impl Clock for EspBoard {
    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Delay for EspBoard {
    fn delay_us(&mut self, us: u32) {
        Ets::delay_us(us);
    }
}

impl Board for EspBoard {
    type Bus = EspOneWire;

    fn one_wire(&mut self) -> &mut EspOneWire {
        &mut self.bus
    }
}
