use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::core::time::{DateTime, Duration};
use crate::outlet::{ChannelId, OutletState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum HistoryState {
    #[display("ON")]
    On,
    #[display("OFF")]
    Off,
    #[display("UNKNOWN")]
    Unknown,
}

impl From<OutletState> for HistoryState {
    fn from(state: OutletState) -> Self {
        match state {
            OutletState::On => HistoryState::On,
            OutletState::Off => HistoryState::Off,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchingEvent {
    #[serde(rename = "outletInternalId")]
    pub channel: ChannelId,
    pub time: DateTime,
    pub state: HistoryState,
}

impl SwitchingEvent {
    pub fn new(channel: ChannelId, time: DateTime, state: impl Into<HistoryState>) -> Self {
        Self {
            channel,
            time,
            state: state.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowRecord {
    pub evicted: Option<SwitchingEvent>,
    pub unknown_from: SwitchingEvent,
    last_evicted: DateTime,
}

impl OverflowRecord {
    fn new(evicted: SwitchingEvent) -> Self {
        Self {
            unknown_from: unknown_after(evicted.channel, evicted.time),
            last_evicted: evicted.time,
            evicted: Some(evicted),
        }
    }

    fn events(&self) -> impl Iterator<Item = SwitchingEvent> + '_ {
        self.evicted.iter().cloned().chain([self.unknown_from.clone()])
    }

    fn after(self, cutoff: DateTime) -> Option<Self> {
        match self.evicted.as_ref().map(|e| e.time) {
            _ if self.last_evicted <= cutoff => None,
            Some(first) if first <= cutoff => Some(Self {
                evicted: None,
                unknown_from: unknown_after(self.unknown_from.channel, cutoff),
                last_evicted: self.last_evicted,
            }),
            _ => Some(self),
        }
    }
}

fn unknown_after(channel: ChannelId, time: DateTime) -> SwitchingEvent {
    SwitchingEvent::new(channel, time + Duration::millis(1), HistoryState::Unknown)
}

#[derive(Debug, Clone)]
pub struct SwitchingHistoryLog {
    capacity: usize,
    events: VecDeque<SwitchingEvent>,
    overflow: BTreeMap<ChannelId, OverflowRecord>,
}

impl SwitchingHistoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
            overflow: BTreeMap::new(),
        }
    }

    pub fn append(&mut self, event: SwitchingEvent) {
        self.events.push_back(event);

        while self.events.len() > self.capacity {
            let Some(evicted) = self.events.pop_front() else {
                break;
            };

            if let Some(record) = self.overflow.get_mut(&evicted.channel) {
                record.last_evicted = record.last_evicted.max(evicted.time);
                continue;
            }

            let record = OverflowRecord::new(evicted);
            tracing::warn!(
                "Outlet history discarded for channel {} from {}",
                record.unknown_from.channel,
                record.unknown_from.time
            );
            self.overflow.insert(record.unknown_from.channel, record);
        }
    }

    #[cfg(test)]
    pub fn live(&self) -> impl Iterator<Item = &SwitchingEvent> {
        self.events.iter()
    }

    #[cfg(test)]
    pub fn overflow(&self, channel: ChannelId) -> Option<&OverflowRecord> {
        self.overflow.get(&channel)
    }

    pub fn events(&self) -> Vec<SwitchingEvent> {
        self.overflow
            .values()
            .flat_map(OverflowRecord::events)
            .chain(self.events.iter().cloned())
            .collect()
    }

    pub fn latest_time(&self) -> Option<DateTime> {
        let live = self.events.iter().map(|event| event.time);
        let evicted = self.overflow.values().map(|record| record.last_evicted);

        live.chain(evicted).max()
    }

    /// Forgets everything that happened at or before `cutoff`. Evictions
    /// after the cutoff stay marked, so a channel whose gap extends past the
    /// cutoff does not get a second record.
    pub fn clear(&mut self, cutoff: DateTime) {
        self.events.retain(|event| event.time > cutoff);
        self.overflow = std::mem::take(&mut self.overflow)
            .into_iter()
            .filter_map(|(channel, record)| record.after(cutoff).map(|record| (channel, record)))
            .collect();
    }
}
