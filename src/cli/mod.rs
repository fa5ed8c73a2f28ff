//! Command handlers for the `dbpool` binary
//!
//! - `simulate`: run a pool against the simulated backend and print its metrics
//! - `config`: print the effective configuration

pub mod commands;

pub use commands::{cmd_config, cmd_simulate, SimulateOptions};
