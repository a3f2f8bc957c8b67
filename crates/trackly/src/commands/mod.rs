//! Subcommand handlers.

pub mod config_cmd;
pub mod eta;
pub mod watch;
