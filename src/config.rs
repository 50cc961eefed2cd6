use crate::prelude::*;

use crate::v5::modbus::MAX_READ_COUNT;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub logger: Logger,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub polling: Polling,

    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub mqtt: Mqtt,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// poll the logger every scan interval
    #[default]
    Poll,
    /// also listen for frames pushed by the logger, polling only when none arrived
    Push,
}

// Logger {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Logger {
    /// empty when the logger only pushes
    #[serde(default)]
    pub host: String,
    #[serde(default = "Config::default_logger_port")]
    pub port: u16,
    pub serial: u32,
    #[serde(default = "Config::default_slave_id")]
    pub slave_id: u8,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_socket_timeout")]
    pub socket_timeout: Duration,
}

impl Logger {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }
} // }}}

// Server {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Server {
    #[serde(default = "Config::default_server_bind")]
    pub bind: String,
    #[serde(default = "Config::default_server_port")]
    pub port: u16,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_idle_timeout")]
    pub idle_timeout: Duration,
    #[serde(default = "Config::default_read_buffer")]
    pub read_buffer: usize,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            bind: Config::default_server_bind(),
            port: Config::default_server_port(),
            idle_timeout: Config::default_idle_timeout(),
            read_buffer: Config::default_read_buffer(),
        }
    }
}

impl Server {
    pub fn bind(&self) -> &str {
        &self.bind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn read_buffer(&self) -> usize {
        self.read_buffer
    }
} // }}}

// Polling {{{
#[serde_as]
#[derive(Clone, Debug, Deserialize)]
pub struct Polling {
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_scan_interval")]
    pub scan_interval: Duration,
    #[serde(default = "Config::default_attempts")]
    pub attempts: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "Config::default_backoff")]
    pub backoff: Duration,
    #[serde(default = "Config::default_read_plan")]
    pub read_plan: Vec<ReadBlock>,
    #[serde(default = "Config::default_holding_plan")]
    pub holding_plan: Vec<ReadBlock>,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            scan_interval: Config::default_scan_interval(),
            attempts: Config::default_attempts(),
            backoff: Config::default_backoff(),
            read_plan: Config::default_read_plan(),
            holding_plan: Config::default_holding_plan(),
        }
    }
}

impl Polling {
    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn read_plan(&self) -> Vec<ReadBlock> {
        self.read_plan.clone()
    }

    pub fn holding_plan(&self) -> Vec<ReadBlock> {
        self.holding_plan.clone()
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Default for Mqtt {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: Config::default_mqtt_port(),
            username: None,
            password: None,
            namespace: Config::default_mqtt_namespace(),
        }
    }
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

#[derive(Clone, Debug)]
pub struct ConfigWrapper {
    config: Arc<Config>,
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        Ok(Self::from_config(Config::new(file)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn logger(&self) -> Logger {
        self.config.logger.clone()
    }

    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    pub fn server(&self) -> Server {
        self.config.server.clone()
    }

    pub fn polling(&self) -> Polling {
        self.config.polling.clone()
    }

    pub fn calibration(&self) -> CalibrationConfig {
        self.config.calibration
    }

    pub fn mqtt(&self) -> Mqtt {
        self.config.mqtt.clone()
    }

    pub fn loglevel(&self) -> String {
        self.config.loglevel.clone()
    }

    pub fn log_summary(&self) {
        self.config.log_summary()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| file_error!("error reading {}: {}", file, err))?;

        Self::from_yaml(&content).with_context(|| format!("invalid configuration in {}", file))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded successfully:");
        info!("  Logger:");
        info!("    Serial: {}", self.logger.serial);
        if self.logger.host.is_empty() {
            info!("    Host: none (push only)");
        } else {
            info!("    Host: {}:{}", self.logger.host, self.logger.port);
        }
        info!("    Slave ID: {}", self.logger.slave_id);
        info!("    Socket Timeout: {:?}", self.logger.socket_timeout);
        info!("  Mode: {:?}", self.mode);
        if self.mode == Mode::Push {
            info!("    Listen: {}:{}", self.server.bind, self.server.port);
            info!("    Idle Timeout: {:?}", self.server.idle_timeout);
        }
        info!("  Polling:");
        info!("    Scan Interval: {:?}", self.polling.scan_interval);
        info!("    Attempts: {} ({:?} apart)", self.polling.attempts, self.polling.backoff);
        for block in &self.polling.read_plan {
            info!("    Read: {} registers from {}", block.count, block.start);
        }
        info!(
            "  Calibration: CO2 {} kg/kWh, battery {} kWh, {} rated cycles",
            self.calibration.co2_factor,
            self.calibration.battery_capacity,
            self.calibration.battery_rated_cycles
        );
        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}", self.mqtt.host);
            info!("    Port: {}", self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
        }
        info!("  Log Level: {}", self.loglevel);
    }

    fn validate(&self) -> Result<()> {
        if self.logger.serial == 0 {
            bail!("logger.serial is required");
        }
        if self.mode == Mode::Poll && self.logger.host.is_empty() {
            bail!("logger.host is required in poll mode");
        }
        if self.logger.port == 0 {
            bail!("logger.port must be between 1 and 65535");
        }
        if self.mode == Mode::Push && self.server.read_buffer == 0 {
            bail!("server.read_buffer must be greater than 0");
        }
        if self.polling.attempts == 0 {
            bail!("polling.attempts must be at least 1");
        }
        if self.polling.scan_interval.is_zero() {
            bail!("polling.scan_interval must be greater than 0");
        }
        if self.polling.read_plan.is_empty() {
            bail!("polling.read_plan cannot be empty");
        }
        for block in self.polling.read_plan.iter().chain(&self.polling.holding_plan) {
            if block.count == 0 || block.count > MAX_READ_COUNT {
                bail!(
                    "read block ({}, {}) must read between 1 and {} registers",
                    block.start,
                    block.count,
                    MAX_READ_COUNT
                );
            }
        }
        if self.calibration.battery_capacity < 0.0 {
            bail!("calibration.battery_capacity cannot be negative");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
        }

        Ok(())
    }

    fn default_logger_port() -> u16 {
        8899
    }

    fn default_slave_id() -> u8 {
        1
    }

    fn default_socket_timeout() -> Duration {
        Duration::from_secs(10)
    }

    fn default_server_bind() -> String {
        "0.0.0.0".to_string()
    }

    fn default_server_port() -> u16 {
        8080
    }

    fn default_idle_timeout() -> Duration {
        Duration::from_secs(300)
    }

    fn default_read_buffer() -> usize {
        4096
    }

    fn default_scan_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_attempts() -> u32 {
        3
    }

    fn default_backoff() -> Duration {
        Duration::from_secs(2)
    }

    fn default_read_plan() -> Vec<ReadBlock> {
        register::INPUT_READ_PLAN.to_vec()
    }

    fn default_holding_plan() -> Vec<ReadBlock> {
        register::HOLDING_READ_PLAN.to_vec()
    }

    fn default_mqtt_port() -> u16 {
        1883
    }

    fn default_mqtt_namespace() -> String {
        "solarman".to_string()
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
}
