use std::sync::{Arc, Mutex, PoisonError};

use crate::core::state_machine::{StateMachine, StateMachineHandle};
use crate::core::time::{ClockSync, DateTime, Duration};
use crate::port::{DeviceId, RemoteService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatState {
    Waiting,
    SendingHeartbeat,
}

type HeartbeatListener = Box<dyn Fn(DateTime) + Send + Sync>;

#[derive(Clone, Default)]
pub struct HeartbeatInterface {
    listener: Arc<Mutex<Option<HeartbeatListener>>>,
}

impl HeartbeatInterface {
    pub fn on_heartbeat(&self, listener: impl Fn(DateTime) + Send + Sync + 'static) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(listener));
    }

    fn notify(&self, time: DateTime) {
        if let Some(listener) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            listener(time);
        }
    }
}

struct Heartbeat<R> {
    remote: Arc<R>,
    device: DeviceId,
    clock: Arc<ClockSync>,
    interval: Duration,
    idle: Duration,
    last_heartbeat: Mutex<Option<DateTime>>,
    interface: HeartbeatInterface,
}

pub fn build_heartbeat_machine<R: RemoteService>(
    remote: Arc<R>,
    device: DeviceId,
    clock: Arc<ClockSync>,
    interval: Duration,
    idle: Duration,
) -> StateMachine<HeartbeatState, HeartbeatInterface> {
    let interface = HeartbeatInterface::default();
    let heartbeat = Arc::new(Heartbeat {
        remote,
        device,
        clock,
        interval,
        idle,
        last_heartbeat: Mutex::new(None),
        interface: interface.clone(),
    });

    let mut machine = StateMachine::new("Heartbeat", HeartbeatState::Waiting).with_interface(interface);

    let h = heartbeat.clone();
    machine.add_handler(HeartbeatState::Waiting, move |machine| {
        let h = h.clone();
        async move { h.wait(machine).await }
    });

    let h = heartbeat;
    machine.add_handler(HeartbeatState::SendingHeartbeat, move |machine| {
        let h = h.clone();
        async move { h.send(machine).await }
    });

    machine
}

impl<R: RemoteService> Heartbeat<R> {
    async fn wait(&self, machine: StateMachineHandle<HeartbeatState>) -> anyhow::Result<()> {
        let last = *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner);

        if is_heartbeat_due(last, self.clock.get_time(), self.interval) {
            machine.change_state(HeartbeatState::SendingHeartbeat);
        } else {
            tokio::time::sleep(self.idle.to_std()).await;
        }

        Ok(())
    }

    async fn send(&self, machine: StateMachineHandle<HeartbeatState>) -> anyhow::Result<()> {
        if let Err(e) = self.remote.send_heartbeat(&self.device).await {
            tracing::error!("Error sending heartbeat: {}", e);
            return Err(e.into());
        }

        let now = self.clock.get_time();
        tracing::debug!("Heartbeat");
        *self.last_heartbeat.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        self.interface.notify(now);

        machine.change_state(HeartbeatState::Waiting);
        Ok(())
    }
}

fn is_heartbeat_due(last: Option<DateTime>, now: DateTime, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => {
            let elapsed = now.elapsed_since(last);
            elapsed < Duration::ZERO || elapsed >= interval
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::test_support::FakeRemote;
    use crate::t;

    #[test]
    fn heartbeat_due_after_interval() {
        let last = DateTime::from_millis(100_000);

        assert!(is_heartbeat_due(None, last, t!(30 seconds)));
        assert!(!is_heartbeat_due(Some(last), last + t!(29 seconds), t!(30 seconds)));
        assert!(is_heartbeat_due(Some(last), last + t!(30 seconds), t!(30 seconds)));
        assert!(is_heartbeat_due(Some(last), last - t!(1 seconds), t!(30 seconds)));
    }

    #[tokio::test(start_paused = true)]
    async fn sends_heartbeats_and_notifies_listener() {
        let remote = Arc::new(FakeRemote::default());
        let clock = Arc::new(ClockSync::system());
        let machine = build_heartbeat_machine(remote.clone(), "dev-1".into(), clock, t!(1 hours), t!(100 millis));

        let seen = Arc::new(Mutex::new(vec![]));
        let listener_seen = seen.clone();
        machine
            .interface()
            .unwrap()
            .on_heartbeat(move |time| listener_seen.lock().unwrap().push(time));

        let handle = machine.handle();
        let task = tokio::spawn(machine.run());
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        handle.stop().await;
        task.await.unwrap();

        assert_eq!(remote.calls_of("send_heartbeat"), vec!["send_heartbeat dev-1"]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(handle.current_state(), HeartbeatState::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_heartbeat_is_reported_to_listeners() {
        let remote = Arc::new(FakeRemote::default());
        remote.fail_next("send_heartbeat");
        let clock = Arc::new(ClockSync::system());
        let mut machine = build_heartbeat_machine(remote.clone(), "dev-1".into(), clock, t!(1 hours), t!(100 millis))
            .with_pause_after_error(std::time::Duration::from_millis(50));

        let errors = Arc::new(Mutex::new(vec![]));
        let listener_errors = errors.clone();
        machine.on_error(move |e| listener_errors.lock().unwrap().push(e.to_string()));

        let handle = machine.handle();
        let task = tokio::spawn(machine.run());
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        handle.stop().await;
        task.await.unwrap();

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(remote.calls_of("send_heartbeat").len(), 2);
    }
}
