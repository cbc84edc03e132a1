mod http;
mod push;

pub use http::HttpRemoteService;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSettings {
    pub base_url: String,
    pub auth_token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_topic_prefix() -> String {
    "controllers".to_string()
}

impl RemoteSettings {
    pub fn peer(&self) -> anyhow::Result<String> {
        let url = reqwest::Url::parse(&self.base_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("Remote url {} has no host", self.base_url))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("Remote url {} has no port", self.base_url))?;

        Ok(format!("{}:{}", host, port))
    }
}
