//! CLI module for storefront-realtime
//!
//! Provides command-line interface for:
//! - listen: Connect, subscribe and print events until Ctrl-C
//! - send: Send one message and exit

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{listen, run, run_command, send};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{read_data, write_event, write_json};
