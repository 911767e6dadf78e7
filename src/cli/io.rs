//! JSON I/O handling for CLI
//!
//! - Events go to stdout, one JSON object per line
//! - Logs go to stderr
//! - UTF-8 only

use std::io::{self, Read, Write};

use serde_json::Value;

use crate::realtime::RealtimeEvent;

use super::errors::{CliError, CliResult};

/// Parse a `--data` argument; `-` reads the payload from stdin
pub fn read_data(arg: &str) -> CliResult<Value> {
    let text = if arg == "-" {
        let mut buf = String::new();
        io::stdin().lock().read_to_string(&mut buf)?;
        buf
    } else {
        arg.to_string()
    };

    if text.trim().is_empty() {
        return Err(CliError::invalid_argument("Empty payload"));
    }

    let value: Value = serde_json::from_str(&text)?;
    Ok(value)
}

/// Write an event in its wire form
pub fn write_event(event: &RealtimeEvent) -> CliResult<()> {
    let value = serde_json::to_value(event.to_wire())?;
    write_json(&value)
}

/// Write a JSON value to stdout
pub fn write_json(value: &Value) -> CliResult<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();

    serde_json::to_writer(&mut handle, value)?;
    writeln!(handle)?;
    handle.flush()?;

    Ok(())
}
