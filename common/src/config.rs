use serde::{Deserialize, Serialize};

use crate::topics::{DEFAULT_COMMAND_TOPIC, DEFAULT_SENSOR_TOPIC};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub pilot_led: i32,
    pub actuator: i32,
    /// ADC-capable GPIO wired to the light sensor divider.
    pub brightness_channel: u8,
    pub temperature: i32,
    pub ir_tx: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            pilot_led: 2,
            actuator: 5,
            brightness_channel: 36,
            temperature: 4,
            ir_tx: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPeriods {
    pub brightness_ms: u64,
    pub temperature_ms: u64,
    pub publish_ms: u64,
}

impl Default for TaskPeriods {
    fn default() -> Self {
        Self {
            brightness_ms: 200,
            temperature_ms: 200,
            publish_ms: 1_000,
        }
    }
}

impl TaskPeriods {
    pub fn sanitize(&mut self) {
        self.brightness_ms = self.brightness_ms.max(10);
        self.temperature_ms = self.temperature_ms.max(10);
        self.publish_ms = self.publish_ms.max(100);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IrHardwareConfig {
    pub tx_pin: i32,
    pub carrier_hz: u32,
    pub duty_cycle: f32,
}

impl Default for IrHardwareConfig {
    fn default() -> Self {
        Self {
            tx_pin: 14,
            carrier_hz: 38_000,
            duty_cycle: 0.5,
        }
    }
}

impl IrHardwareConfig {
    pub fn sanitize(&mut self) {
        if self.tx_pin < 0 {
            self.tx_pin = 14;
        }

        self.carrier_hz = self.carrier_hz.clamp(10_000, 100_000);

        if !self.duty_cycle.is_finite() || self.duty_cycle <= 0.0 {
            self.duty_cycle = 0.5;
        }
        self.duty_cycle = self.duty_cycle.min(1.0);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub wifi_ssid: String,
    #[serde(default)]
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub device_id: String,
    /// printf-style template; `%s` is replaced by the device id.
    pub sensor_topic: String,
    pub command_topic: String,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub periods: TaskPeriods,
    #[serde(default)]
    pub ir: IrHardwareConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_id: "ambient-node".to_string(),
            sensor_topic: DEFAULT_SENSOR_TOPIC.to_string(),
            command_topic: DEFAULT_COMMAND_TOPIC.to_string(),
            pins: PinConfig::default(),
            periods: TaskPeriods::default(),
            ir: IrHardwareConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Clamp tunables into range and keep the IR pin consistent with the pin map.
    pub fn sanitize(&mut self) {
        self.periods.sanitize();
        self.ir.tx_pin = self.pins.ir_tx;
        self.ir.sanitize();
        self.pins.ir_tx = self.ir.tx_pin;
    }
}
