use std::sync::{Arc, Mutex, PoisonError};

use crate::command::{CommandBatch, CommandScheduler};
use crate::core::state_machine::{StateMachine, StateMachineHandle};
use crate::core::time::{ClockSync, DateTime, Duration};
use crate::port::{DeviceId, RemoteService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandRefreshState {
    Initializing,
    Waiting,
    FetchingCommands,
}

#[derive(Clone)]
pub struct CommandRefreshInterface {
    scheduler: CommandScheduler,
}

impl CommandRefreshInterface {
    pub fn ingest_commands(&self, batch: CommandBatch) {
        tracing::info!("Ingesting commands for {} channels", batch.len());
        self.scheduler.ingest_commands(batch);
    }
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    min_interval: Duration,
    max_interval: Duration,
    last_refresh: Option<DateTime>,
    next_refresh: Option<DateTime>,
}

impl RefreshPolicy {
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval,
            last_refresh: None,
            next_refresh: None,
        }
    }

    pub fn is_due(&self, now: DateTime) -> bool {
        let Some(last_refresh) = self.last_refresh else {
            return true;
        };

        let elapsed = now.elapsed_since(last_refresh);
        if elapsed < Duration::ZERO {
            return true;
        }

        if elapsed < self.min_interval {
            return false;
        }

        self.next_refresh.is_some_and(|next| next <= now) || elapsed >= self.max_interval
    }

    pub fn refreshed(&mut self, now: DateTime, hint: Option<DateTime>) -> DateTime {
        let next = match hint {
            Some(hint) => hint.max(now + self.min_interval),
            None => now + self.max_interval,
        };

        self.last_refresh = Some(now);
        self.next_refresh = Some(next);
        next
    }
}

struct CommandRefresh<R> {
    remote: Arc<R>,
    device: DeviceId,
    clock: Arc<ClockSync>,
    scheduler: CommandScheduler,
    idle: Duration,
    policy: Mutex<RefreshPolicy>,
}

pub fn build_command_refresh_machine<R: RemoteService>(
    remote: Arc<R>,
    device: DeviceId,
    clock: Arc<ClockSync>,
    scheduler: CommandScheduler,
    min_interval: Duration,
    max_interval: Duration,
    idle: Duration,
) -> StateMachine<CommandRefreshState, CommandRefreshInterface> {
    let interface = CommandRefreshInterface {
        scheduler: scheduler.clone(),
    };
    let refresh = Arc::new(CommandRefresh {
        remote,
        device,
        clock,
        scheduler,
        idle,
        policy: Mutex::new(RefreshPolicy::new(min_interval, max_interval)),
    });

    let mut machine =
        StateMachine::new("CommandRefresh", CommandRefreshState::Initializing).with_interface(interface.clone());

    let r = refresh.clone();
    machine.add_handler(CommandRefreshState::Initializing, move |machine| {
        let r = r.clone();
        async move {
            r.scheduler.start_background_executor();
            machine.change_state(CommandRefreshState::Waiting);
            Ok(())
        }
    });

    let r = refresh.clone();
    machine.add_handler(CommandRefreshState::Waiting, move |machine| {
        let r = r.clone();
        async move { r.wait(machine).await }
    });

    let r = refresh;
    machine.add_handler(CommandRefreshState::FetchingCommands, move |machine| {
        let (r, interface) = (r.clone(), interface.clone());
        async move { r.fetch(machine, &interface).await }
    });

    machine
}

impl<R: RemoteService> CommandRefresh<R> {
    fn policy(&self) -> std::sync::MutexGuard<'_, RefreshPolicy> {
        self.policy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait(&self, machine: StateMachineHandle<CommandRefreshState>) -> anyhow::Result<()> {
        let due = self.policy().is_due(self.clock.get_time());

        if due {
            machine.change_state(CommandRefreshState::FetchingCommands);
        } else {
            tokio::time::sleep(self.idle.to_std()).await;
        }

        Ok(())
    }

    async fn fetch(
        &self,
        machine: StateMachineHandle<CommandRefreshState>,
        interface: &CommandRefreshInterface,
    ) -> anyhow::Result<()> {
        let batch = self.remote.fetch_commands(&self.device).await?;
        interface.ingest_commands(batch);

        let now = self.clock.get_time();
        let next = self.policy().refreshed(now, self.scheduler.refresh_commands_hint());
        tracing::info!("Next command retrieval: +{} seconds", next.elapsed_since(now).as_secs());

        machine.change_state(CommandRefreshState::Waiting);
        Ok(())
    }
}
