mod catalog;
mod clock;
mod config;
mod detector;
mod diagnose;
mod error;
mod logging;
mod market_refresh;
mod selection;
mod sink;
mod state;
mod subscription;
mod types;
mod ws;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catalog::{CatalogGateway, GammaCatalog};
use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, SinksConfig, CHANNEL_CAPACITY, SINK_DISCORD, SINK_REDIS, SINK_STDOUT};
use crate::detector::{SignalDetector, SignalEngine};
use crate::error::{AppError, Result};
use crate::market_refresh::MarketDiscovery;
use crate::sink::discord::DiscordSink;
use crate::sink::redis::RedisSink;
use crate::sink::stdout::StdoutSink;
use crate::sink::{Dispatcher, EventRouter, Sink};
use crate::subscription::{FeedCommand, SubscriptionController};
use crate::types::{DomainEvent, FeedEvent, TokenRegistry};
use crate::ws::{FeedSession, TungsteniteTransport};

/// Polymarket realtime monitoring engine
#[derive(Parser, Debug)]
#[command(name = "pme", version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML or YAML). Defaults to config/default.toml when present.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Discover markets, stream the feed and publish events (default)
    Run,
    /// Check DNS, discovery API and feed host reachability
    Diagnose,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match AppConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init(&cfg.logging) {
        eprintln!("Logging error: {e}");
        std::process::exit(1);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Diagnose => {
            let report = diagnose::run(&cfg).await;
            println!("{report}");
            if !report.ok() {
                std::process::exit(1);
            }
        }
        Command::Run => {
            if let Err(e) = run(cfg).await {
                error!("Fatal error: {e}");
                std::process::exit(1);
            }
        }
    }
}

async fn run(cfg: AppConfig) -> Result<()> {
    info!(
        categories = ?cfg.categories(),
        refresh_sec = cfg.app.refresh_interval_sec,
        ws_url = %cfg.clob.ws_url,
        "Starting pme v{}",
        env!("CARGO_PKG_VERSION"),
    );

    let shutdown = CancellationToken::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let router = Arc::new(build_router(&cfg.sinks)?);
    let catalog: Arc<dyn CatalogGateway> = Arc::new(GammaCatalog::new(&cfg.gamma)?);

    // --- Channels ---
    let (events_tx, events_rx) = mpsc::channel::<DomainEvent>(CHANNEL_CAPACITY);
    let (feed_tx, feed_rx) = mpsc::channel::<FeedEvent>(CHANNEL_CAPACITY);
    let (command_tx, command_rx) = mpsc::channel::<FeedCommand>(CHANNEL_CAPACITY);
    let (expired_tx, expired_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    let (registry_tx, registry_rx) = watch::channel(Arc::new(TokenRegistry::new()));

    // --- Spawn tasks ---

    // Dispatcher: router fan-out, drains on shutdown
    let dispatcher = Dispatcher::new(
        Arc::clone(&router),
        events_rx,
        shutdown.clone(),
        Duration::from_secs(cfg.sinks.drain_grace_sec),
    );
    let dispatch_task = tokio::spawn(dispatcher.run());

    // Feed session
    let session = FeedSession::new(
        cfg.clob.clone(),
        TungsteniteTransport::new(),
        Arc::clone(&clock),
        command_rx,
        feed_tx,
        events_tx.clone(),
        shutdown.clone(),
    );
    let feed_stats = session.stats();
    let feed_task = supervise("feed", session.run(), shutdown.clone());

    // Signal detector (hot path)
    let detector = SignalDetector::new(
        SignalEngine::new(cfg.signals.clone(), Arc::clone(&clock)),
        feed_rx,
        registry_rx,
        events_tx.clone(),
        expired_tx,
        shutdown.clone(),
    );
    let detector_task = supervise("detector", detector.run(), shutdown.clone());

    // Discovery (every refresh_interval_sec)
    let discovery = MarketDiscovery::new(
        &cfg,
        catalog,
        SubscriptionController::new(command_tx, registry_tx),
        clock,
        events_tx,
        expired_rx,
        shutdown.clone(),
    );
    let discovery_task = supervise("discovery", discovery.run(), shutdown.clone());

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("ctrl-c received, shutting down");
        }
        _ = shutdown.cancelled() => info!("a task stopped, shutting down"),
    }
    shutdown.cancel();

    for (name, task) in [("discovery", discovery_task), ("feed", feed_task), ("detector", detector_task)] {
        if let Err(e) = task.await {
            error!(task = name, "task panicked: {e}");
        }
    }
    feed_stats.log_summary();

    match dispatch_task.await {
        Ok(Ok(summary)) => info!(?summary, "shutdown complete"),
        Ok(Err(e)) => error!("dispatcher failed: {e}"),
        Err(e) => error!("dispatcher panicked: {e}"),
    }
    Ok(())
}

/// Runs a long-lived task; an error cancels the whole service.
fn supervise<F>(name: &'static str, fut: F, shutdown: CancellationToken) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            error!(task = name, "task failed: {e}");
            shutdown.cancel();
        }
    })
}

fn build_router(cfg: &SinksConfig) -> Result<EventRouter> {
    let mut router = EventRouter::from_config(cfg)?;
    for name in cfg.enabled_sinks() {
        let sink: Arc<dyn Sink> = match name {
            SINK_STDOUT => Arc::new(StdoutSink::new()),
            SINK_REDIS => Arc::new(RedisSink::new(&cfg.redis)?),
            SINK_DISCORD => Arc::new(DiscordSink::new(&cfg.discord)?),
            other => return Err(AppError::Config(format!("unknown sink `{other}`"))),
        };
        router = router.with_sink(sink);
    }
    info!(sinks = ?router.sink_names(), mode = ?cfg.mode, "sinks ready");
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["pme"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());

        let cli = Cli::try_parse_from(["pme", "diagnose", "--config", "cfg.yaml"]).unwrap();
        assert_eq!(cli.command, Some(Command::Diagnose));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("cfg.yaml")));
    }

    #[test]
    fn router_gets_one_sink_per_enabled_name() {
        let mut cfg = SinksConfig::default();
        cfg.redis.enabled = false;
        let router = build_router(&cfg).unwrap();
        assert_eq!(router.sink_names(), vec!["stdout"]);
    }
}
