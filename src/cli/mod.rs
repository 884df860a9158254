//! Command-line interface for taskq.
//!
//! Provides commands for enqueueing tasks, inspecting queues, and running
//! lease recovery.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
