//! # sio
//!
//! Chat client binary: runs a protocol client library in QuickJS (or the
//! in-process relay when no library is given), announces the display name
//! and publishes each line read from stdin.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use sio_client::Session;
use sio_core::settings::{load_settings, load_settings_from_path};
use sio_core::{ErrorPayload, Value};
use sio_engine::loopback::{loopback, LoopbackOptions, LoopbackRemote};
use sio_engine::{EngineFactory, QuickJsFactory};
use sio_telemetry::{init_telemetry, TelemetryConfig};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Chat over a hosted protocol client.
#[derive(Parser, Debug)]
#[command(name = "sio", about = "Chat over a hosted protocol client")]
struct Cli {
    /// Settings file (defaults to `~/.sio/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Server endpoint (overrides settings).
    #[arg(long)]
    endpoint: Option<String>,

    /// Name announced when joining (overrides settings).
    #[arg(long)]
    name: Option<String>,

    /// Log level such as `debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Protocol client library to run in QuickJS. Without one the session
    /// talks to an in-process relay.
    #[arg(long)]
    library: Option<PathBuf>,

    /// Global the library defines to construct a client.
    #[arg(long, default_value = "io")]
    factory: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    if let Some(endpoint) = cli.endpoint {
        settings.endpoint = endpoint;
    }
    if let Some(name) = cli.name {
        settings.display_name = name;
    }

    let level = cli.log_level.as_deref().unwrap_or(&settings.log_level);
    let telemetry = TelemetryConfig {
        json: cli.json_logs,
        ..TelemetryConfig::default()
    }
    .with_level_name(level);
    let _telemetry = init_telemetry(telemetry);

    let (factory, remote): (Box<dyn EngineFactory>, Option<LoopbackRemote>) = match &cli.library {
        Some(path) => {
            let factory = QuickJsFactory::from_file(path, cli.factory.as_str())
                .with_context(|| format!("Failed to read client library: {}", path.display()))?;
            (Box::new(factory), None)
        }
        None => {
            let (factory, remote) = loopback(LoopbackOptions {
                relay: true,
                ..Default::default()
            });
            (Box::new(factory), Some(remote))
        }
    };
    let session = Session::connect(&settings.endpoint, settings.session.clone(), factory)
        .await
        .context("Failed to open session")?;
    tracing::info!(session = %session.id(), endpoint = %settings.endpoint, "Session open");

    session.on_connect(|| tracing::info!("Connected"));
    session.on_disconnect(|| tracing::info!("Disconnected"));
    session.on_error(|payload: ErrorPayload| tracing::warn!(?payload, "Protocol error"));
    session.on_reconnect_attempt(|attempt| tracing::info!(attempt, "Reconnecting"));
    session.subscribe("publish", |args| {
        for arg in &args {
            println!("{}", render(arg));
        }
    })?;

    if let Some(remote) = &remote {
        remote.connect();
    }
    session.send("connected", vec![Value::from(settings.display_name.as_str())])?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => session.send("publish", vec![Value::from(line)])?,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    tracing::info!(stats = %session.stats().to_json(), "Shutting down");
    session.close();
    Ok(())
}

fn render(value: &Value) -> String {
    match value {
        Value::Text(text) => text.clone(),
        Value::List(items) => items.iter().map(render).collect::<Vec<_>>().join(" "),
        other => other
            .to_json()
            .map(|json| json.to_string())
            .unwrap_or_else(|| format!("<{}>", other.kind())),
    }
}
