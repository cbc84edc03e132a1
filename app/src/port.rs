use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::command::CommandBatch;
use crate::core::time::DateTime;
use crate::outlet::{ChannelId, OutletState, OutletType};
use crate::status::StatusReport;
use crate::switching::SwitchingEvent;

pub type Capabilities = BTreeMap<OutletType, BTreeMap<ChannelId, String>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display, derive_more::From)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryReceipt {
    Accepted,
    AlreadySeen,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NewCommands(CommandBatch),
    StatusRequested,
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::Error)]
pub enum RemoteError {
    #[display("Authentication required")]
    AuthenticationRequired,
    #[display("Not connected to the orchestrator")]
    Disconnected,
    #[display("Transport error: {message}")]
    Transport { message: String },
    #[display("Request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[display("Invalid payload: {message}")]
    InvalidPayload { message: String },
}

pub trait RemoteService: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    fn authenticate(&self) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn register_capabilities(
        &self,
        capabilities: &Capabilities,
    ) -> impl Future<Output = Result<DeviceId, RemoteError>> + Send;

    fn signal_boot(&self, device: &DeviceId) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn fetch_time(&self) -> impl Future<Output = Result<DateTime, RemoteError>> + Send;

    fn fetch_commands(&self, device: &DeviceId) -> impl Future<Output = Result<CommandBatch, RemoteError>> + Send;

    fn send_heartbeat(&self, device: &DeviceId) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn report_history(
        &self,
        device: &DeviceId,
        history: &[SwitchingEvent],
    ) -> impl Future<Output = Result<HistoryReceipt, RemoteError>> + Send;

    fn report_status(
        &self,
        device: &DeviceId,
        status: &StatusReport,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn subscribe(
        &self,
        device: &DeviceId,
    ) -> impl Future<Output = Result<mpsc::Receiver<ServerEvent>, RemoteError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum PinLevel {
    #[display("HIGH")]
    High,
    #[display("LOW")]
    Low,
}

impl From<OutletState> for PinLevel {
    fn from(state: OutletState) -> Self {
        match state {
            OutletState::On => PinLevel::High,
            OutletState::Off => PinLevel::Low,
        }
    }
}

pub trait PinDriver: Send + Sync {
    fn open(&self, channel: ChannelId, initial: PinLevel) -> anyhow::Result<()>;

    fn write(&self, channel: ChannelId, level: PinLevel) -> anyhow::Result<()>;
}
