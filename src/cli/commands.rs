//! CLI command implementations
//!
//! Each command builds its own [`RealtimeContext`] over a WebSocket
//! connector, does its work on one channel and closes it before returning.

use std::str::FromStr;

use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::realtime::{ConnectionConfig, RealtimeContext, Topic, TopicFilter, WireMessage};

use super::args::{Cli, Command};
use super::errors::{CliError, CliResult};
use super::io::{read_data, write_event, write_json};

/// Parse arguments, load configuration and run the selected command
pub fn run() -> CliResult<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = cli.url.as_deref() {
        config = config.with_url(url)?;
    }

    init_tracing(&config.log_level)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_command(cli.command, &config))
}

/// Run a command
pub async fn run_command(command: Command, config: &ClientConfig) -> CliResult<()> {
    match command {
        Command::Listen {
            channel,
            topics,
            user_id,
        } => listen(config, &channel, &topics, user_id).await,
        Command::Send {
            channel,
            kind,
            event,
            data,
        } => send(config, &channel, &kind, &event, &data).await,
    }
}

fn init_tracing(level: &str) -> CliResult<()> {
    let filter = EnvFilter::try_new(level)
        .map_err(|e| CliError::config_error(format!("Invalid REALTIME_LOG: {}", e)))?;

    // stdout carries events; logs go to stderr
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| CliError::config_error(e.to_string()))
}

fn parse_filters(topics: &[String]) -> CliResult<Vec<TopicFilter>> {
    topics
        .iter()
        .map(|t| TopicFilter::from_str(t).map_err(CliError::from))
        .collect()
}

/// Connect, subscribe and print events until Ctrl-C
pub async fn listen(
    config: &ClientConfig,
    channel: &str,
    topics: &[String],
    user_id: Option<String>,
) -> CliResult<()> {
    let filters = parse_filters(topics)?;

    let context = RealtimeContext::from_config(config);
    context.bind_publisher(channel);

    for filter in filters {
        context.dispatcher().subscribe(filter, |event| {
            if let Err(e) = write_event(event) {
                tracing::warn!(error = %e, "failed to write event");
            }
        });
    }

    context
        .connections()
        .connect(channel, ConnectionConfig::default())
        .await?;

    if let Some(user_id) = user_id.as_deref() {
        let session_id = Uuid::new_v4().to_string();
        context.presence().initialize(user_id, &session_id, None);
    }

    tracing::info!(channel, url = %config.ws_url, "listening, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if user_id.is_some() {
        let _ = context.presence().set_offline();
    }
    context.presence().shutdown();
    context.connections().close(channel).await;

    let metrics = context.metrics();
    tracing::info!(
        dispatched = metrics.events_dispatched,
        sent = metrics.messages_sent,
        reconnects = metrics.reconnect_attempts,
        "stopped"
    );
    Ok(())
}

/// Send one message and wait for it to be written
pub async fn send(
    config: &ClientConfig,
    channel: &str,
    kind: &str,
    event: &str,
    data: &str,
) -> CliResult<()> {
    let topic = Topic::from_str(kind)?;
    if event.trim().is_empty() {
        return Err(CliError::invalid_argument("Event name must not be empty"));
    }
    let data = read_data(data)?;

    let message = WireMessage::new(topic.as_str(), event, data);
    let id = message.id.clone();

    let context = RealtimeContext::from_config(config);
    context
        .connections()
        .connect(channel, ConnectionConfig::default())
        .await?;

    context.connections().send(channel, message);
    context.connections().close(channel).await;

    write_json(&json!({ "sent": id, "type": topic.as_str(), "event": event }))
}
