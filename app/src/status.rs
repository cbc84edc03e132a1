use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;
use tokio::net::UdpSocket;

use crate::command::CommandBatch;
use crate::core::time::DateTime;
use crate::outlet::ChannelId;
use crate::switching::PinState;

pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub software_version: String,
    pub boot_time: DateTime,
    pub device_time: DateTime,
    pub application_time: DateTime,
    pub last_heartbeat: Option<DateTime>,
    pub network_addresses: Vec<IpAddr>,
    pub commands: CommandBatch,
    pub pin_states: BTreeMap<ChannelId, PinState>,
    pub recent_logs: Vec<String>,
}

pub async fn outbound_addresses(peer: &str) -> Vec<IpAddr> {
    let mut addresses = vec![];

    for bind in ["0.0.0.0:0", "[::]:0"] {
        match outbound_address(bind, peer).await {
            Ok(address) => addresses.push(address),
            Err(e) => tracing::debug!("No route to {} from {}: {:?}", peer, bind, e),
        }
    }

    addresses
}

async fn outbound_address(bind: &str, peer: &str) -> anyhow::Result<IpAddr> {
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(peer).await?;

    Ok(socket.local_addr()?.ip())
}
