mod history;
mod service;

pub use history::{SwitchingEvent, SwitchingHistoryLog};
pub use service::{PinState, SwitchingOutputs};

#[cfg(test)]
pub use history::HistoryState;
#[cfg(test)]
pub use service::test_support::RecordingPinDriver;
