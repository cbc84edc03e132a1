pub mod gpio;
pub mod remote;
