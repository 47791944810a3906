//! Wardstream CLI
//!
//! `wardstream watch <ward>` follows a ward's event stream and prints each
//! event; `wardstream queue status|flush|clear` manages the persisted error
//! queue.

mod probe;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use probe::SystemProbe;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wardstream::stream::{ConnectionState, EventKind, StreamClient, StreamEvent, StreamParams};
use wardstream::telemetry::{
    ErrorQueue, ErrorReport, HttpTelemetrySink, QueueStorage, SyncOutcome,
};
use wardstream::traits::EnvironmentProbe;
use wardstream::{WardstreamConfig, DEFAULT_CONFIG_FILE};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file
    #[arg(short, long, env = "WARDSTREAM_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug logging for wardstream crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream a ward's events to stdout
    Watch {
        /// Ward (resource key) to follow
        ward: String,

        /// Priority filter
        #[arg(long)]
        priority: Option<String>,

        /// Analysis depth
        #[arg(long)]
        depth: Option<String>,

        /// Free-form context
        #[arg(long)]
        context: Option<String>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Inspect or manage the persisted error queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show queued errors
    Status,
    /// Send queued errors now
    Flush,
    /// Drop every queued error
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "info,wardstream=debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let config = WardstreamConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Watch {
            ward,
            priority,
            depth,
            context,
            json,
        } => {
            let mut params = StreamParams::default();
            if let Some(priority) = priority {
                params = params.with_priority(priority);
            }
            if let Some(depth) = depth {
                params = params.with_depth(depth);
            }
            if let Some(context) = context {
                params = params.with_context(context);
            }
            watch(&config, ward, params, json).await
        }
        Command::Queue { action } => match action {
            QueueAction::Status => queue_status(&config),
            QueueAction::Flush => queue_flush(&config).await,
            QueueAction::Clear => queue_clear(&config),
        },
    }
}

fn system_probe(config: &WardstreamConfig) -> anyhow::Result<Arc<SystemProbe>> {
    let endpoint = config.endpoint_url()?;
    let host = endpoint
        .host_str()
        .context("stream endpoint has no host")?
        .to_string();
    let port = endpoint
        .port_or_known_default()
        .context("stream endpoint has no port")?;
    Ok(Arc::new(SystemProbe::new(host, port)))
}

fn error_queue(config: &WardstreamConfig, probe: Arc<SystemProbe>) -> anyhow::Result<Option<ErrorQueue>> {
    let Some(endpoint) = config.telemetry_endpoint()? else {
        return Ok(None);
    };
    let sink = HttpTelemetrySink::new(endpoint)?;
    Ok(Some(ErrorQueue::new(
        config.queue_config(),
        Arc::new(sink),
        Arc::new(config.queue_storage()),
        probe,
    )))
}

fn describe(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Connected { resource_key } => format!("connected to {}", resource_key),
        StreamEvent::Disconnected { reason, .. } => format!("disconnected ({})", reason),
        StreamEvent::Reconnecting { attempt, delay } => {
            format!("reconnecting (attempt {}, in {:?})", attempt, delay)
        }
        StreamEvent::Error { message } => format!("error: {}", message),
        StreamEvent::QualityChanged { from, to } => format!("network {} -> {}", from, to),
        other => match serde_json::to_value(other) {
            Ok(value) => value
                .get("data")
                .map(|data| data.to_string())
                .unwrap_or_default(),
            Err(_) => String::new(),
        },
    }
}

async fn watch(
    config: &WardstreamConfig,
    ward: String,
    params: StreamParams,
    json: bool,
) -> anyhow::Result<()> {
    let probe = system_probe(config)?;
    let queue = error_queue(config, Arc::clone(&probe))?.map(Arc::new);
    if let Some(queue) = &queue {
        queue.start();
    }

    let client = StreamClient::http(config.stream_config()?, probe)?;
    for kind in EventKind::ALL {
        let queue = queue.clone();
        client.on(kind, move |event| {
            if json {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
                }
            } else {
                println!("[{}] {}", event.kind(), describe(event));
            }

            if let (Some(queue), StreamEvent::Error { message }) = (&queue, event) {
                queue.push(ErrorReport::new(message.clone()).with_component("watch"));
            }
        });
    }

    client.connect(ward.clone(), params).await?;
    tracing::info!(ward = %ward, "Watching");

    let mut state = client.subscribe_state();
    let failed = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                client.disconnect().await;
                break false;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break false;
                }
                if *state.borrow() == ConnectionState::Failed {
                    break true;
                }
            }
        }
    };

    if let Some(queue) = &queue {
        queue.flush().await;
        queue.destroy();
    }

    if failed {
        bail!("stream for {} failed permanently", ward);
    }
    Ok(())
}

fn queue_status(config: &WardstreamConfig) -> anyhow::Result<()> {
    let storage = config.queue_storage();
    let items = storage
        .load()
        .with_context(|| format!("reading {}", storage.path().display()))?;

    println!("queue:    {}", storage.path().display());
    println!("session:  {}", storage.session_id()?.unwrap_or_else(|| "-".into()));
    println!("pending:  {}", items.len());

    let mut by_category = std::collections::BTreeMap::new();
    for item in &items {
        *by_category.entry(item.category.as_str()).or_insert(0usize) += 1;
    }
    for (category, count) in by_category {
        println!("  {:<10} {}", category, count);
    }
    Ok(())
}

async fn queue_flush(config: &WardstreamConfig) -> anyhow::Result<()> {
    let probe = system_probe(config)?;
    probe.probe_latency().await.ok();

    let Some(queue) = error_queue(config, probe)? else {
        bail!("no telemetry_url configured; set WARDSTREAM_TELEMETRY_URL");
    };

    let outcome = queue.flush().await;
    let stats = queue.stats();
    queue.destroy();

    match outcome {
        SyncOutcome::Ran(report) => println!(
            "synced {}, dropped {}, remaining {}{}",
            stats.synced_total,
            stats.dropped_total,
            stats.pending,
            if report.rate_limited { " (rate limited)" } else { "" }
        ),
        SyncOutcome::Skipped(reason) => println!("nothing sent: {:?}", reason),
    }
    Ok(())
}

fn queue_clear(config: &WardstreamConfig) -> anyhow::Result<()> {
    let storage = config.queue_storage();
    let pending = storage.load().map(|items| items.len()).unwrap_or(0);
    storage
        .save(&[])
        .with_context(|| format!("writing {}", storage.path().display()))?;
    println!("cleared {} queued errors", pending);
    Ok(())
}
