mod command_refresh;
mod heartbeat;
mod root;

#[cfg(test)]
pub mod test_support;

pub use root::{AgentContext, RootMachine};
