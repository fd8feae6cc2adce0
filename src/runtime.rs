//! Runtime glue: configuration, run notification, telemetry, and the node
//! that wires every component together.

pub mod config;
pub mod node;
pub mod notify;
pub mod telemetry;
