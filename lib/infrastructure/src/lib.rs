mod http;
mod monitoring;
mod mqtt;

pub use monitoring::{EnvFilterConfig, MonitoringConfig, OtlpConfig, RecentLogLayer, RecentLogs};

pub use http::client::HttpClientConfig;
pub use mqtt::{Mqtt, MqttClient, MqttConfig, MqttInMessage, MqttSubscription};
