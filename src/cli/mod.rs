//! Command-line interface for docfarm.
//!
//! Provides the coordinator, worker and submit entry points.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
