use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::core::time::{ClockSync, DateTime, Duration};
use crate::outlet::{ChannelId, OutletState};
use crate::port::{PinDriver, PinLevel};
use crate::switching::{SwitchingEvent, SwitchingHistoryLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PinState {
    pub state: OutletState,
    pub last_switched_at: Option<DateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched,
    Unchanged,
    TooFast,
    UnknownChannel,
    DriverFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryReport {
    pub events: Vec<SwitchingEvent>,
    pub cutoff: Option<DateTime>,
}

#[derive(Clone)]
pub struct SwitchingOutputs {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Box<dyn PinDriver>,
    clock: Arc<ClockSync>,
    min_switch_interval: Duration,
    state: Mutex<OutputsState>,
}

struct OutputsState {
    pins: BTreeMap<ChannelId, PinState>,
    history: SwitchingHistoryLog,
}

impl SwitchingOutputs {
    pub fn new(
        channels: impl IntoIterator<Item = ChannelId>,
        driver: impl PinDriver + 'static,
        clock: Arc<ClockSync>,
        min_switch_interval: Duration,
        history_capacity: usize,
    ) -> anyhow::Result<Self> {
        let mut pins = BTreeMap::new();

        for channel in channels {
            driver.open(channel, PinLevel::Low)?;
            pins.insert(
                channel,
                PinState {
                    state: OutletState::Off,
                    last_switched_at: None,
                },
            );
        }

        Ok(Self {
            inner: Arc::new(Inner {
                driver: Box::new(driver),
                clock,
                min_switch_interval,
                state: Mutex::new(OutputsState {
                    pins,
                    history: SwitchingHistoryLog::new(history_capacity),
                }),
            }),
        })
    }

    pub fn set_channel_state(&self, channel: ChannelId, desired: OutletState) -> SwitchOutcome {
        let now = self.inner.clock.get_time();
        let mut guard = self.inner.lock();
        let OutputsState { pins, history } = &mut *guard;

        let Some(pin) = pins.get_mut(&channel) else {
            tracing::warn!("Not switching unknown channel {}", channel);
            return SwitchOutcome::UnknownChannel;
        };

        if pin.state == desired {
            return SwitchOutcome::Unchanged;
        }

        if let Some(last_switched_at) = pin.last_switched_at {
            //negative after the clock was set back, switching is allowed then
            let elapsed = now.elapsed_since(last_switched_at);
            if elapsed >= Duration::ZERO && elapsed < self.inner.min_switch_interval {
                tracing::debug!("Won't switch channel {}: switching too fast", channel);
                return SwitchOutcome::TooFast;
            }
        }

        if let Err(e) = self.inner.driver.write(channel, desired.into()) {
            tracing::error!("Error switching channel {} {}: {:?}", channel, desired, e);
            return SwitchOutcome::DriverFailed;
        }

        tracing::debug!("Channel {} {}", channel, desired);
        *pin = PinState {
            state: desired,
            last_switched_at: Some(now),
        };
        history.append(SwitchingEvent::new(channel, now, desired));

        SwitchOutcome::Switched
    }

    pub fn all_off(&self) {
        let now = self.inner.clock.get_time();
        let mut guard = self.inner.lock();
        let OutputsState { pins, history } = &mut *guard;

        for (channel, pin) in pins.iter_mut() {
            if let Err(e) = self.inner.driver.write(*channel, PinLevel::Low) {
                tracing::error!("Error switching off channel {}: {:?}", channel, e);
                continue;
            }

            if pin.state != OutletState::Off {
                *pin = PinState {
                    state: OutletState::Off,
                    last_switched_at: Some(now),
                };
                history.append(SwitchingEvent::new(*channel, now, OutletState::Off));
            }
        }

        tracing::info!("All outputs switched off");
    }

    pub fn pin_states(&self) -> BTreeMap<ChannelId, PinState> {
        self.inner.lock().pins.clone()
    }

    #[cfg(test)]
    pub fn switching_history(&self) -> Vec<SwitchingEvent> {
        self.history_report().events
    }

    /// Switching history together with the cutoff it covers, taken in one
    /// step so that nothing appended afterwards is cleared with it.
    pub fn history_report(&self) -> HistoryReport {
        let now = self.inner.clock.get_time();
        let state = self.inner.lock();

        let mut events = state.history.events();
        events.extend(
            state
                .pins
                .iter()
                .map(|(channel, pin)| SwitchingEvent::new(*channel, now, pin.state)),
        );

        HistoryReport {
            events,
            cutoff: state.history.latest_time(),
        }
    }

    pub fn clear_switching_history(&self, cutoff: DateTime) {
        self.inner.lock().history.clear(cutoff);
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, OutputsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingPinDriver;
    use super::*;
    use crate::core::time::ManualClock;
    use crate::switching::HistoryState;
    use crate::t;

    const PUMP: ChannelId = ChannelId::new(5);
    const LAMP: ChannelId = ChannelId::new(6);

    struct Fixture {
        local: Arc<ManualClock>,
        driver: RecordingPinDriver,
        outputs: SwitchingOutputs,
    }

    fn fixture(history_capacity: usize) -> Fixture {
        let local = ManualClock::new(DateTime::from_millis(1_000_000));
        let clock = Arc::new(ClockSync::new(local.clone()));
        let driver = RecordingPinDriver::default();
        let outputs = SwitchingOutputs::new([PUMP, LAMP], driver.clone(), clock, t!(2 seconds), history_capacity)
            .unwrap();

        Fixture { local, driver, outputs }
    }

    fn live_events(outputs: &SwitchingOutputs) -> Vec<SwitchingEvent> {
        let history = outputs.switching_history();
        history[..history.len() - 2].to_vec()
    }

    #[test]
    fn opens_all_channels_low() {
        let f = fixture(10);

        assert_eq!(f.driver.writes(), vec![(PUMP, PinLevel::Low), (LAMP, PinLevel::Low)]);
        assert!(f.outputs.pin_states().values().all(|pin| pin.state == OutletState::Off));
    }

    #[test]
    fn switching_writes_pin_and_records_event() {
        let f = fixture(10);

        let outcome = f.outputs.set_channel_state(PUMP, OutletState::On);

        assert_eq!(outcome, SwitchOutcome::Switched);
        assert_eq!(f.driver.writes().last(), Some(&(PUMP, PinLevel::High)));
        assert_eq!(
            live_events(&f.outputs),
            vec![SwitchingEvent::new(PUMP, DateTime::from_millis(1_000_000), OutletState::On)]
        );
    }

    #[test]
    fn same_state_is_a_no_op() {
        let f = fixture(10);

        assert_eq!(f.outputs.set_channel_state(PUMP, OutletState::Off), SwitchOutcome::Unchanged);
        assert_eq!(f.driver.writes().len(), 2);
    }

    #[test]
    fn switching_twice_within_interval_switches_once() {
        let f = fixture(10);

        f.outputs.set_channel_state(PUMP, OutletState::On);
        f.local.advance(t!(1999 millis));
        let second = f.outputs.set_channel_state(PUMP, OutletState::Off);

        assert_eq!(second, SwitchOutcome::TooFast);
        assert_eq!(live_events(&f.outputs).len(), 1);
        assert_eq!(f.outputs.pin_states()[&PUMP].state, OutletState::On);

        f.local.advance(t!(1 millis));
        assert_eq!(f.outputs.set_channel_state(PUMP, OutletState::Off), SwitchOutcome::Switched);
    }

    #[test]
    fn debounce_is_per_channel() {
        let f = fixture(10);

        f.outputs.set_channel_state(PUMP, OutletState::On);

        assert_eq!(f.outputs.set_channel_state(LAMP, OutletState::On), SwitchOutcome::Switched);
    }

    #[test]
    fn clock_moved_backwards_does_not_block_switching() {
        let f = fixture(10);

        f.outputs.set_channel_state(PUMP, OutletState::On);
        f.local.advance(t!(-1 hours));

        assert_eq!(f.outputs.set_channel_state(PUMP, OutletState::Off), SwitchOutcome::Switched);
    }

    #[test]
    fn driver_failure_leaves_state_for_retry() {
        let f = fixture(10);

        f.driver.fail(true);
        assert_eq!(f.outputs.set_channel_state(PUMP, OutletState::On), SwitchOutcome::DriverFailed);
        assert_eq!(f.outputs.pin_states()[&PUMP].state, OutletState::Off);
        assert!(live_events(&f.outputs).is_empty());

        f.driver.fail(false);
        assert_eq!(f.outputs.set_channel_state(PUMP, OutletState::On), SwitchOutcome::Switched);
    }

    #[test]
    fn unknown_channel_is_rejected() {
        let f = fixture(10);

        assert_eq!(
            f.outputs.set_channel_state(ChannelId::new(99), OutletState::On),
            SwitchOutcome::UnknownChannel
        );
    }

    #[test]
    fn history_ends_with_current_state_of_every_channel() {
        let f = fixture(10);
        f.outputs.set_channel_state(PUMP, OutletState::On);
        f.local.advance(t!(5 seconds));

        let history = f.outputs.switching_history();

        let now = DateTime::from_millis(1_005_000);
        assert_eq!(
            history[history.len() - 2..],
            [
                SwitchingEvent::new(PUMP, now, OutletState::On),
                SwitchingEvent::new(LAMP, now, OutletState::Off)
            ]
        );
    }

    #[test]
    fn overflow_is_reported_and_survives_clear_after_cutoff() {
        let f = fixture(2);
        let report_before_overflow = f.outputs.history_report();
        assert_eq!(report_before_overflow.cutoff, None);

        for state in [OutletState::On, OutletState::Off, OutletState::On] {
            f.outputs.set_channel_state(PUMP, state);
            f.local.advance(t!(3 seconds));
        }

        let report = f.outputs.history_report();
        assert_eq!(report.events[0], SwitchingEvent::new(PUMP, DateTime::from_millis(1_000_000), OutletState::On));
        assert_eq!(report.events[1].state, HistoryState::Unknown);
        assert_eq!(report.events[1].time, DateTime::from_millis(1_000_001));
        assert_eq!(report.cutoff, Some(DateTime::from_millis(1_006_000)));

        f.outputs.clear_switching_history(DateTime::from_millis(999_999));
        let history = f.outputs.switching_history();
        assert_eq!(history[1].state, HistoryState::Unknown);
        assert_eq!(history.len(), 2 + 2 + 2);
    }

    #[test]
    fn clear_keeps_events_after_cutoff() {
        let f = fixture(10);
        f.outputs.set_channel_state(PUMP, OutletState::On);
        let report = f.outputs.history_report();

        f.local.advance(t!(1 seconds));
        f.outputs.set_channel_state(LAMP, OutletState::On);
        f.outputs.clear_switching_history(report.cutoff.unwrap());

        assert_eq!(
            live_events(&f.outputs),
            vec![SwitchingEvent::new(LAMP, DateTime::from_millis(1_001_000), OutletState::On)]
        );
    }

    #[test]
    fn all_off_bypasses_debounce() {
        let f = fixture(10);
        f.outputs.set_channel_state(PUMP, OutletState::On);

        f.outputs.all_off();

        assert!(f.outputs.pin_states().values().all(|pin| pin.state == OutletState::Off));
        assert_eq!(f.driver.writes()[f.driver.writes().len() - 2..], [(PUMP, PinLevel::Low), (LAMP, PinLevel::Low)]);
        assert_eq!(live_events(&f.outputs).len(), 2);
    }
}
