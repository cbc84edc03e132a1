mod domain;
mod schedule;
mod service;

pub use domain::*;
pub use schedule::CommandSchedule;
pub use service::CommandScheduler;
