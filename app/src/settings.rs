use config::{Config, ConfigError, Environment, File};
use infrastructure::{MonitoringConfig, MqttConfig};
use serde::Deserialize;

use crate::adapter::gpio::GpioSettings;
use crate::adapter::remote::RemoteSettings;
use crate::core::time::Duration;
use crate::outlet::OutletSpec;
use crate::t;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub remote: RemoteSettings,
    pub mqtt: MqttConfig,
    pub monitoring: MonitoringConfig,
    pub outlets: Vec<OutletSpec>,
    #[serde(default)]
    pub gpio: GpioSettings,
    #[serde(default)]
    pub timing: AgentTiming,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("config.toml")
    }

    fn from_file(file_name: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(file_name))
            .add_source(Environment::with_prefix("AGENT").separator("__"));

        let s = builder.build()?;
        s.try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentTiming {
    pub tick: Duration,
    pub min_switch_interval: Duration,
    pub history_capacity: usize,
    pub lead_time: Duration,
    pub command_refresh_min_interval: Duration,
    pub command_refresh_max_interval: Duration,
    pub heartbeat_interval: Duration,
    pub history_report_interval: Duration,
    pub idle: Duration,
    pub pause_after_error: Duration,
    pub connection_poll: Duration,
}

impl Default for AgentTiming {
    fn default() -> Self {
        Self {
            tick: t!(100 millis),
            min_switch_interval: t!(2 seconds),
            history_capacity: 100,
            lead_time: t!(10 minutes),
            command_refresh_min_interval: t!(10 seconds),
            command_refresh_max_interval: t!(30 minutes),
            heartbeat_interval: t!(30 seconds),
            history_report_interval: t!(60 seconds),
            idle: t!(500 millis),
            pause_after_error: t!(2 seconds),
            connection_poll: t!(200 millis),
        }
    }
}
