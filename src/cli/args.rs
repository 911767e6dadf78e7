//! CLI argument definitions using clap
//!
//! Commands:
//! - storefront-realtime listen --channel <key> --topic <topic>... [--user-id <id>]
//! - storefront-realtime send --channel <key> --type <topic> --event <name> --data <json>

use clap::{Parser, Subcommand};

/// Realtime client for the storefront event server
#[derive(Parser, Debug)]
#[command(name = "storefront-realtime")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Server address; overrides REALTIME_WS_URL
    #[arg(long, global = true)]
    pub url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print incoming events as JSON lines until interrupted
    Listen {
        /// Channel key
        #[arg(long, default_value = "main")]
        channel: String,

        /// Topics to follow (`cart`, `product`, `order`, `notification`, `user`, `system` or `*`)
        #[arg(long = "topic", default_value = "*")]
        topics: Vec<String>,

        /// Announce presence as this user while listening
        #[arg(long)]
        user_id: Option<String>,
    },

    /// Send a single message and exit
    Send {
        /// Channel key
        #[arg(long, default_value = "main")]
        channel: String,

        /// Topic of the message
        #[arg(long = "type")]
        kind: String,

        /// Event name, e.g. `cart.updated`
        #[arg(long)]
        event: String,

        /// JSON payload, or `-` to read it from stdin
        #[arg(long, default_value = "{}")]
        data: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
