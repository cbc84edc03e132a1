pub mod builder;
mod clock;
mod datetime;
mod duration;

pub use clock::ClockSync;
pub use datetime::DateTime;
pub use duration::Duration;

#[cfg(test)]
pub use clock::ManualClock;
