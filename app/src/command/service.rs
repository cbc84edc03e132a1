use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandBatch, CommandSchedule};
use crate::core::time::{ClockSync, DateTime, Duration};
use crate::outlet::ChannelId;
use crate::switching::SwitchingOutputs;

#[derive(Clone)]
pub struct CommandScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    schedule: Mutex<CommandSchedule>,
    clock: Arc<ClockSync>,
    outputs: SwitchingOutputs,
    tick_interval: Duration,
    lead_time: Duration,
    executor: Mutex<Option<CancellationToken>>,
}

impl CommandScheduler {
    pub fn new(
        channels: impl IntoIterator<Item = ChannelId>,
        clock: Arc<ClockSync>,
        outputs: SwitchingOutputs,
        tick_interval: Duration,
        lead_time: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                schedule: Mutex::new(CommandSchedule::new(channels)),
                clock,
                outputs,
                tick_interval,
                lead_time,
                executor: Mutex::new(None),
            }),
        }
    }

    pub fn ingest_commands(&self, batch: CommandBatch) {
        let now = self.inner.clock.get_time();
        self.inner.schedule().ingest(batch, now);
    }

    pub fn refresh_commands_hint(&self) -> Option<DateTime> {
        let now = self.inner.clock.get_time();
        self.inner.schedule().refresh_hint(now, self.inner.lead_time)
    }

    pub fn commands(&self) -> CommandBatch {
        self.inner.schedule().snapshot()
    }

    pub fn tick(&self) {
        let now = self.inner.clock.get_time();
        let schedule = self.inner.schedule();

        for channel in schedule.channels() {
            let desired = schedule.desired_state(channel, now);
            self.inner.outputs.set_channel_state(channel, desired);
        }
    }

    pub fn start_background_executor(&self) {
        let mut executor = self.inner.executor();
        if executor.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *executor = Some(token.clone());

        let scheduler = self.clone();
        tokio::spawn(async move {
            tracing::info!("Command executor started, ticking every {}", scheduler.inner.tick_interval);

            let period = scheduler.inner.tick_interval.to_std();
            run_every(period, &token, || {
                scheduler.tick();
                std::future::ready(())
            })
            .await;

            tracing::info!("Command executor stopped");
        });
    }

    #[cfg(test)]
    pub fn is_executor_running(&self) -> bool {
        self.inner
            .executor()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    pub fn stop_background_executor(&self) {
        if let Some(token) = self.inner.executor().take() {
            token.cancel();
        }
    }
}

//ticks are anchored to the start, a slow tick is not replayed
async fn run_every<F, Fut>(period: std::time::Duration, token: &CancellationToken, mut on_tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticks = tokio::time::interval(period.max(std::time::Duration::from_millis(1)));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticks.tick() => on_tick().await,
        }
    }
}

impl Inner {
    fn schedule(&self) -> MutexGuard<'_, CommandSchedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn executor(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.executor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
