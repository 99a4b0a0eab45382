//! tsbridge binary entry point
//!
//! Listens for one SRT caller, publishes its TS on the in-process bus and,
//! when a target is configured, re-muxes the same stream out to another SRT
//! listener.
//!
//! # Usage
//!
//! ```bash
//! # Ingest only, listening on 0.0.0.0:1234
//! cargo run -p tsbridge --features libsrt
//!
//! # Ingest and push the stream on to a relay
//! cargo run -p tsbridge --features libsrt -- \
//!   --srt-host 0.0.0.0:9000 \
//!   --srt-target relay.example.com:9001
//!
//! # Everything from a file, `TSBRIDGE_*` variables still win
//! cargo run -p tsbridge --features libsrt -- --config tsbridge.toml
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tsbridge::{
    check_subscribers, global_metrics, Config, EgressSession, IngestSession, MediaBus,
    SessionError,
};
use tsbridge_srt::SrtLibrary;

/// SRT <-> MPEG-TS bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TSBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Local host:port the ingest listener binds to
    #[arg(long)]
    srt_host: Option<String>,

    /// Remote host:port egress pushes TS to
    #[arg(long)]
    srt_target: Option<String>,

    /// Stream name used by both directions
    #[arg(long)]
    stream: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.srt_host {
            config.ingest.host = host;
        }
        if let Some(target) = self.srt_target {
            config.egress.target = Some(target);
        }
        if let Some(stream) = self.stream {
            config.ingest.stream = stream.clone();
            config.egress.stream = stream;
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_ref())?;
    args.apply(&mut config);

    let default_filter = config.logging.filter.as_deref().unwrap_or("info");
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        ingest = %config.ingest.host,
        stream = %config.ingest.stream,
        target = ?config.egress.target,
        poll_ms = config.srt.poll_interval_ms,
        "Starting tsbridge"
    );

    // Single media context: bus, gate and muxer never leave this thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build the media runtime")?;
    let result = runtime.block_on(run(config));

    let metrics = global_metrics().snapshot();
    tracing::info!(
        sessions = metrics.sessions_started,
        chunks_relayed = metrics.chunks_relayed,
        bytes_relayed = metrics.bytes_relayed,
        frames_published = metrics.frames_published,
        frames_forwarded = metrics.frames_forwarded,
        configs_synthesized = metrics.configs_synthesized,
        frames_dropped = metrics.frames_dropped,
        writes_dropped = metrics.writes_dropped,
        "tsbridge shutdown complete"
    );
    result
}

async fn run(config: Config) -> Result<()> {
    let library = SrtLibrary::global();
    let options = config.srt.endpoint_options();
    let health_interval = options.poll_interval;
    let mut bus = MediaBus::new();

    if let Some(target) = &config.egress.target {
        let session = EgressSession::start(
            &config.egress.stream,
            target,
            options.clone(),
            library.clone(),
        )
        .with_context(|| format!("egress to {target} failed to start"))?;
        bus.subscribe(&config.egress.stream, Box::new(session));
    }

    let result = if config.ingest.enabled {
        let mut ingest = IngestSession::start(
            &config.ingest.stream,
            &config.ingest.host,
            options,
            library,
            &mut bus,
        )
        .with_context(|| format!("ingest on {} failed to start", config.ingest.host))?;
        let result = ingest.run(&mut bus, shutdown_signal()).await;
        ingest.stop(&mut bus);
        result.context("bridge session failed")
    } else {
        tracing::info!("ingest disabled, waiting for shutdown");
        supervise(&bus, health_interval)
            .await
            .context("egress session failed")
    };

    // Dropping the handlers closes the egress endpoint
    drop(bus.shutdown());
    result
}

/// Watch subscriber health until a shutdown signal arrives
async fn supervise(bus: &MediaBus, interval: Duration) -> Result<(), SessionError> {
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut health = tokio::time::interval(interval);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = health.tick() => {
                if let Err(e) = check_subscribers(bus) {
                    tracing::error!(error = %e, "stopping on subscriber failure");
                    return Err(e);
                }
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
