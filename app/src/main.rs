use std::sync::Arc;

use anyhow::Context as _;
use settings::Settings;

use crate::adapter::remote::HttpRemoteService;
use crate::command::CommandScheduler;
use crate::core::time::ClockSync;
use crate::machine::{AgentContext, RootMachine};
use crate::outlet::ChannelId;
use crate::switching::SwitchingOutputs;

mod adapter;
mod command;
mod core;
mod machine;
mod outlet;
pub mod port;
mod settings;
mod status;
mod switching;

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> anyhow::Result<()> {
    let settings = Settings::new().context("Error reading configuration")?;
    let recent_logs = settings
        .monitoring
        .init()
        .map_err(|e| anyhow::anyhow!("Error initializing monitoring: {}", e))?;
    let timing = settings.timing.clone();

    let clock = Arc::new(ClockSync::system());
    let channels: Vec<ChannelId> = settings.outlets.iter().map(|outlet| outlet.channel).collect();

    let outputs = SwitchingOutputs::new(
        channels.clone(),
        settings.gpio.new_driver(),
        clock.clone(),
        timing.min_switch_interval,
        timing.history_capacity,
    )
    .context("Error opening outputs")?;
    let scheduler = CommandScheduler::new(channels, clock.clone(), outputs.clone(), timing.tick, timing.lead_time);

    let mqtt = settings.mqtt.new_client();
    let remote = HttpRemoteService::new(&settings.remote, mqtt.client()).context("Error creating remote client")?;

    let root = RootMachine::new(AgentContext {
        remote: Arc::new(remote),
        clock,
        scheduler: scheduler.clone(),
        outputs: outputs.clone(),
        outlets: settings.outlets.clone(),
        timing,
        recent_logs,
        remote_peer: settings.remote.peer()?,
    });
    let root_handle = root.handle();

    tracing::info!("Starting outlet agent with {} outlets", settings.outlets.len());
    let mqtt_task = tokio::spawn(mqtt.run());
    let root_task = tokio::spawn(root.run());

    let signal = tokio::signal::ctrl_c().await;
    tracing::info!("Shutting down");

    root_handle.stop().await;
    if let Err(e) = root_task.await {
        tracing::error!("Root machine ended abnormally: {}", e);
    }
    scheduler.stop_background_executor();
    outputs.all_off();
    mqtt_task.abort();

    signal.context("Error waiting for shutdown signal")
}
