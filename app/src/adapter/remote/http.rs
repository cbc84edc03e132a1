use infrastructure::{HttpClientConfig, MqttClient};
use reqwest::{Response, StatusCode};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::RemoteSettings;
use super::push;
use crate::command::CommandBatch;
use crate::core::time::DateTime;
use crate::port::{Capabilities, DeviceId, HistoryReceipt, RemoteError, RemoteService, ServerEvent};
use crate::status::StatusReport;
use crate::switching::SwitchingEvent;

pub struct HttpRemoteService {
    client: ClientWithMiddleware,
    base_url: String,
    mqtt: MqttClient,
    topic_prefix: String,
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    id: DeviceId,
}

#[derive(Debug, Deserialize)]
struct TimeResponse {
    time: ServerTime,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerTime {
    Millis(i64),
    Iso(DateTime),
}

impl From<ServerTime> for DateTime {
    fn from(value: ServerTime) -> Self {
        match value {
            ServerTime::Millis(millis) => DateTime::from_millis(millis),
            ServerTime::Iso(time) => time,
        }
    }
}

#[derive(Debug, Serialize)]
struct HistoryPayload<'a> {
    history: &'a [SwitchingEvent],
}

impl HttpRemoteService {
    pub fn new(settings: &RemoteSettings, mqtt: MqttClient) -> anyhow::Result<Self> {
        let client = HttpClientConfig::new(
            settings.auth_token.clone(),
            std::time::Duration::from_millis(settings.request_timeout_ms),
        )
        .new_tracing_client()?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            mqtt,
            topic_prefix: settings.topic_prefix.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(|e| RemoteError::Transport {
            message: e.to_string(),
        })?;

        check_status(response).await
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED {
        return Err(RemoteError::AuthenticationRequired);
    }

    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(RemoteError::Rejected {
            status: status.as_u16(),
            message,
        });
    }

    Ok(response)
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response.json::<T>().await.map_err(|e| RemoteError::InvalidPayload {
        message: e.to_string(),
    })
}

fn history_receipt(result: Result<Response, RemoteError>) -> Result<HistoryReceipt, RemoteError> {
    match result {
        Ok(_) => Ok(HistoryReceipt::Accepted),
        Err(RemoteError::Rejected { status: 422, .. }) => Ok(HistoryReceipt::AlreadySeen),
        Err(e) => Err(e),
    }
}

impl RemoteService for HttpRemoteService {
    fn is_connected(&self) -> bool {
        self.mqtt.is_connected()
    }

    async fn authenticate(&self) -> Result<(), RemoteError> {
        self.send(self.client.post(self.url("/auth"))).await?;
        Ok(())
    }

    async fn register_capabilities(&self, capabilities: &Capabilities) -> Result<DeviceId, RemoteError> {
        let response = self
            .send(self.client.post(self.url("/controllers")).json(capabilities))
            .await?;

        let RegisterResponse { id } = read_json(response).await?;
        Ok(id)
    }

    async fn signal_boot(&self, device: &DeviceId) -> Result<(), RemoteError> {
        self.send(self.client.post(self.url(&format!("/controllers/{}/boot", device))))
            .await?;
        Ok(())
    }

    async fn fetch_time(&self) -> Result<DateTime, RemoteError> {
        let response = self.send(self.client.get(self.url("/time"))).await?;
        let TimeResponse { time } = read_json(response).await?;
        Ok(time.into())
    }

    async fn fetch_commands(&self, device: &DeviceId) -> Result<CommandBatch, RemoteError> {
        let response = self
            .send(self.client.get(self.url(&format!("/controllers/{}/commands", device))))
            .await?;
        read_json(response).await
    }

    async fn send_heartbeat(&self, device: &DeviceId) -> Result<(), RemoteError> {
        self.send(self.client.post(self.url(&format!("/controllers/{}/heartbeat", device))))
            .await?;
        Ok(())
    }

    async fn report_history(
        &self,
        device: &DeviceId,
        history: &[SwitchingEvent],
    ) -> Result<HistoryReceipt, RemoteError> {
        let request = self
            .client
            .post(self.url(&format!("/controllers/{}/outlets/history", device)))
            .json(&HistoryPayload { history });

        history_receipt(self.send(request).await)
    }

    async fn report_status(&self, device: &DeviceId, status: &StatusReport) -> Result<(), RemoteError> {
        self.send(
            self.client
                .post(self.url(&format!("/controllers/{}/status", device)))
                .json(status),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(&self, device: &DeviceId) -> Result<mpsc::Receiver<ServerEvent>, RemoteError> {
        push::subscribe(&self.mqtt, &self.topic_prefix, device)
            .await
            .map_err(|e| RemoteError::Transport {
                message: format!("{:#}", e),
            })
    }
}
