//! Core agentlink library (event model, transports, sessions, config).

pub mod config;
pub mod core;
pub mod logging;
pub mod transport;
