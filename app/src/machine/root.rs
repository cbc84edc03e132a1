use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context as _;
use infrastructure::RecentLogs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::CommandScheduler;
use crate::core::state_machine::{Priority, StateMachine, StateMachineHandle, StateMatch};
use crate::core::time::{ClockSync, DateTime, Duration};
use crate::machine::command_refresh::{CommandRefreshInterface, CommandRefreshState, build_command_refresh_machine};
use crate::machine::heartbeat::{HeartbeatState, build_heartbeat_machine};
use crate::outlet::{OutletSpec, capabilities};
use crate::port::{DeviceId, HistoryReceipt, RemoteError, RemoteService, ServerEvent};
use crate::settings::AgentTiming;
use crate::status::{SOFTWARE_VERSION, StatusReport, outbound_addresses};
use crate::switching::SwitchingOutputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootState {
    Initializing,
    Authenticating,
    PublishingCapabilities,
    SignalBoot,
    SyncingTime,
    StartingChildMachines,
    SubscribingToEvents,
    Operating,
    Error,
}

impl RootState {
    const ALL: [RootState; 9] = [
        RootState::Initializing,
        RootState::Authenticating,
        RootState::PublishingCapabilities,
        RootState::SignalBoot,
        RootState::SyncingTime,
        RootState::StartingChildMachines,
        RootState::SubscribingToEvents,
        RootState::Operating,
        RootState::Error,
    ];
}

pub struct AgentContext<R> {
    pub remote: Arc<R>,
    pub clock: Arc<ClockSync>,
    pub scheduler: CommandScheduler,
    pub outputs: SwitchingOutputs,
    pub outlets: Vec<OutletSpec>,
    pub timing: AgentTiming,
    pub recent_logs: RecentLogs,
    pub remote_peer: String,
}

pub struct RootMachine<R> {
    machine: StateMachine<RootState>,
    root: Arc<Root<R>>,
}

struct Root<R> {
    ctx: AgentContext<R>,
    boot_time: DateTime,
    last_heartbeat: Arc<Mutex<Option<DateTime>>>,
    session: Mutex<Session>,
}

#[derive(Default)]
struct Session {
    device: Option<DeviceId>,
    did_signal_boot: bool,
    children: Option<Children>,
    push_events: Option<JoinHandle<()>>,
    last_history_report: Option<DateTime>,
}

struct Children {
    command_refresh: StateMachineHandle<CommandRefreshState>,
    commands: CommandRefreshInterface,
    heartbeat: StateMachineHandle<HeartbeatState>,
}

impl<R: RemoteService> RootMachine<R> {
    pub fn new(ctx: AgentContext<R>) -> Self {
        let pause_after_error = ctx.timing.pause_after_error.to_std();
        let root = Arc::new(Root {
            boot_time: ctx.clock.get_time(),
            ctx,
            last_heartbeat: Arc::new(Mutex::new(None)),
            session: Mutex::new(Session::default()),
        });

        let mut machine = StateMachine::new("Root", RootState::Initializing).with_pause_after_error(pause_after_error);

        for state in RootState::ALL {
            let root = root.clone();
            machine.add_handler(state, move |machine| {
                let root = root.clone();
                async move { root.handle(state, machine).await }
            });
        }

        let r = root.clone();
        machine.add_transition_hook(StateMatch::Any, StateMatch::Named(RootState::Error), move || {
            let r = r.clone();
            async move {
                r.tear_down().await;
                Ok(())
            }
        });

        let handle = machine.handle();
        machine.on_error(move |e| match e.downcast_ref::<RemoteError>() {
            Some(RemoteError::AuthenticationRequired) => {
                tracing::error!("Reauthentication needed");
                handle.change_state(RootState::Authenticating);
            }
            _ => {
                tracing::error!("Root: {:?}", e);
                handle.change_state_with_priority(RootState::Error, Priority::Highest);
            }
        });

        Self { machine, root }
    }

    pub fn handle(&self) -> StateMachineHandle<RootState> {
        self.machine.handle()
    }

    pub async fn run(self) {
        self.machine.run().await;
        self.root.tear_down().await;
    }
}

impl<R: RemoteService> Root<R> {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self) -> anyhow::Result<DeviceId> {
        self.session().device.clone().context("Device id has not been assigned")
    }

    async fn handle(self: Arc<Self>, state: RootState, machine: StateMachineHandle<RootState>) -> anyhow::Result<()> {
        let remote = &self.ctx.remote;

        match state {
            RootState::Initializing => {
                if remote.is_connected() {
                    machine.change_state(RootState::Authenticating);
                } else {
                    tokio::time::sleep(self.ctx.timing.connection_poll.to_std()).await;
                }
            }

            RootState::Authenticating => {
                remote.authenticate().await?;
                machine.change_state(RootState::PublishingCapabilities);
            }

            RootState::PublishingCapabilities => {
                let device = remote.register_capabilities(&capabilities(&self.ctx.outlets)).await?;
                tracing::info!("Received id {}", device);

                let mut session = self.session();
                session.device = Some(device);
                machine.change_state(match session.did_signal_boot {
                    true => RootState::SyncingTime,
                    false => RootState::SignalBoot,
                });
            }

            RootState::SignalBoot => {
                remote.signal_boot(&self.device()?).await?;
                tracing::info!("Signalled device boot");
                self.session().did_signal_boot = true;
                machine.change_state(RootState::SyncingTime);
            }

            RootState::SyncingTime => {
                self.sync_time().await?;
                machine.change_state(RootState::StartingChildMachines);
            }

            RootState::StartingChildMachines => {
                self.start_child_machines(&machine)?;
                machine.change_state(RootState::SubscribingToEvents);
            }

            RootState::SubscribingToEvents => {
                let events = remote.subscribe(&self.device()?).await?;
                self.process_events_in_background(events);
                machine.change_state(RootState::Operating);
            }

            RootState::Operating => {
                if !remote.is_connected() {
                    return Err(RemoteError::Disconnected.into());
                }

                if self.is_history_report_due() {
                    self.report_history().await?;
                } else {
                    tokio::time::sleep(self.ctx.timing.idle.to_std()).await;
                }
            }

            RootState::Error => {
                machine.change_state(RootState::Initializing);
            }
        }

        Ok(())
    }

    async fn sync_time(&self) -> anyhow::Result<()> {
        let clock = &self.ctx.clock;

        let started = clock.local_now();
        let server_time = self.ctx.remote.fetch_time().await?;
        let round_trip = clock.local_now().elapsed_since(started).max(Duration::ZERO);

        clock.reset_time(server_time + round_trip.halved());
        Ok(())
    }

    fn start_child_machines(&self, root: &StateMachineHandle<RootState>) -> anyhow::Result<()> {
        let mut session = self.session();
        if session.children.is_some() {
            return Ok(());
        }

        let device = session.device.clone().context("Device id has not been assigned")?;
        let timing = &self.ctx.timing;

        let mut command_refresh = build_command_refresh_machine(
            self.ctx.remote.clone(),
            device.clone(),
            self.ctx.clock.clone(),
            self.ctx.scheduler.clone(),
            timing.command_refresh_min_interval,
            timing.command_refresh_max_interval,
            timing.idle,
        )
        .with_pause_after_error(timing.pause_after_error.to_std());
        command_refresh.on_error(abort_on_error(root.clone()));
        let commands = command_refresh.interface()?.clone();

        let mut heartbeat = build_heartbeat_machine(
            self.ctx.remote.clone(),
            device,
            self.ctx.clock.clone(),
            timing.heartbeat_interval,
            timing.idle,
        )
        .with_pause_after_error(timing.pause_after_error.to_std());
        heartbeat.on_error(abort_on_error(root.clone()));
        let last_heartbeat = self.last_heartbeat.clone();
        heartbeat.interface()?.on_heartbeat(move |time| {
            *last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(time);
        });

        session.children = Some(Children {
            command_refresh: command_refresh.handle(),
            commands,
            heartbeat: heartbeat.handle(),
        });

        tokio::spawn(command_refresh.run());
        tokio::spawn(heartbeat.run());

        Ok(())
    }

    fn process_events_in_background(self: &Arc<Self>, events: mpsc::Receiver<ServerEvent>) {
        let root = self.clone();
        let task = tokio::spawn(async move { root.process_events(events).await });

        if let Some(previous) = self.session().push_events.replace(task) {
            previous.abort();
        }
    }

    async fn process_events(&self, mut events: mpsc::Receiver<ServerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ServerEvent::NewCommands(batch) => {
                    tracing::info!("Received new commands from server");
                    let commands = self.session().children.as_ref().map(|c| c.commands.clone());

                    match commands {
                        Some(commands) => commands.ingest_commands(batch),
                        None => tracing::warn!("Dropping pushed commands, command refresh is not running"),
                    }
                }
                ServerEvent::StatusRequested => {
                    tracing::info!("Sending status data");
                    self.send_status().await;
                }
            }
        }

        tracing::info!("Server event subscription ended");
    }

    fn is_history_report_due(&self) -> bool {
        let last_report = self.session().last_history_report;

        match last_report {
            None => true,
            Some(last) => {
                let elapsed = self.ctx.clock.get_time().elapsed_since(last);
                elapsed < Duration::ZERO || elapsed >= self.ctx.timing.history_report_interval
            }
        }
    }

    async fn report_history(&self) -> anyhow::Result<()> {
        let device = self.device()?;
        let report = self.ctx.outputs.history_report();

        if !report.events.is_empty() {
            let receipt = match self.ctx.remote.report_history(&device, &report.events).await {
                Ok(receipt) => receipt,
                Err(e) => {
                    tracing::error!("Error sending outlet history: {}", e);
                    return Err(e.into());
                }
            };

            tracing::debug!("Sent outlet history ({} records)", report.events.len());
            if receipt == HistoryReceipt::AlreadySeen {
                tracing::warn!("Server indicated that some outlet history records were already seen");
            }

            if let Some(cutoff) = report.cutoff {
                self.ctx.outputs.clear_switching_history(cutoff);
            }
        }

        self.session().last_history_report = Some(self.ctx.clock.get_time());
        Ok(())
    }

    async fn send_status(&self) {
        if let Err(e) = self.try_send_status().await {
            tracing::error!("Failed to send status: {:?}", e);
        }
    }

    async fn try_send_status(&self) -> anyhow::Result<()> {
        let device = self.device()?;
        let network_addresses = outbound_addresses(&self.ctx.remote_peer).await;
        let last_heartbeat = *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner);

        let status = StatusReport {
            software_version: SOFTWARE_VERSION.to_string(),
            boot_time: self.boot_time,
            device_time: self.ctx.clock.local_now(),
            application_time: self.ctx.clock.get_time(),
            last_heartbeat,
            network_addresses,
            commands: self.ctx.scheduler.commands(),
            pin_states: self.ctx.outputs.pin_states(),
            recent_logs: self.ctx.recent_logs.lines(),
        };

        self.ctx.remote.report_status(&device, &status).await?;
        Ok(())
    }

    async fn tear_down(&self) {
        let (children, push_events) = {
            let mut session = self.session();
            (session.children.take(), session.push_events.take())
        };

        if let Some(task) = push_events {
            task.abort();
        }

        if let Some(children) = children {
            children.command_refresh.stop().await;
            children.heartbeat.stop().await;
        }
    }
}

fn abort_on_error(root: StateMachineHandle<RootState>) -> impl Fn(&anyhow::Error) + Send + Sync + 'static {
    move |e| {
        tracing::error!("Child machine failed: {:?}", e);
        root.change_state_with_priority(RootState::Error, Priority::Highest);
    }
}
