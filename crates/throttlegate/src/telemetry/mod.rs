pub mod log;
pub mod stats;

pub use log::{RoutingLog, RoutingLogEntry};
