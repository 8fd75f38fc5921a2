use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use streamtap_config::{CaptureBackendKind, StreamtapConfig};
use streamtap_core::events::MessageEvent;
use streamtap_engine::{MonitorState, NetworkMonitor};
use streamtap_telemetry::{EventLogger, MetricsRecorder};
use tracing::{info, warn};

/// How often the front end checks whether the monitor loop has ended.
const STATE_POLL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "streamtap", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow a process and log every decoded message
    Watch(WatchArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    RawSocket,
    Pcap,
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    /// Target process id (overrides target.process_id)
    #[arg(long, conflicts_with = "window_name")]
    pub pid: Option<u32>,
    /// Target process name (overrides target.window_name)
    #[arg(long)]
    pub window_name: Option<String>,
    /// Monitor this local address instead of the target's own
    #[arg(long)]
    pub local_ip: Option<Ipv4Addr>,
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,
    /// Configuration file (defaults to the layered config/ lookup)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Log payloads as hex
    #[arg(long)]
    pub hex: bool,
    /// Print Prometheus metrics on exit
    #[arg(long)]
    pub metrics: bool,
}

impl WatchArgs {
    fn load_config(&self) -> anyhow::Result<StreamtapConfig> {
        let mut config = match &self.config {
            Some(path) => StreamtapConfig::load_from_path(path),
            None => StreamtapConfig::load(),
        }
        .context("Failed to load configuration")?;
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(&self, config: &mut StreamtapConfig) {
        if let Some(pid) = self.pid {
            config.target.process_id = Some(pid);
            config.target.window_name = None;
        }
        if let Some(name) = &self.window_name {
            config.target.process_id = None;
            config.target.window_name = Some(name.clone());
        }
        if let Some(ip) = self.local_ip {
            config.target.local_ip = Some(ip);
        }
        if let Some(backend) = self.backend {
            config.capture.backend = match backend {
                BackendArg::RawSocket => CaptureBackendKind::RawSocket,
                BackendArg::Pcap => CaptureBackendKind::Pcap,
            };
        }
    }
}

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Watch(args) => watch(args).await,
    }
}

async fn watch(args: WatchArgs) -> anyhow::Result<()> {
    let config = args.load_config()?;
    EventLogger::init(&config.telemetry.log_level);

    let metrics = MetricsRecorder::new().context("Failed to register metrics")?;
    let monitor = Arc::new(NetworkMonitor::from_config(&config)?.with_metrics(metrics.clone()));

    let hex = args.hex;
    monitor.on_message_sent(move |event| log_event(event, hex));
    monitor.on_message_received(move |event| log_event(event, hex));
    monitor.start()?;
    info!("Watching; press Ctrl-C to stop");

    let mut ticker = tokio::time::interval(STATE_POLL);
    let ended_early = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                break false;
            }
            _ = ticker.tick() => {
                if monitor.state() == MonitorState::Idle {
                    break true;
                }
            }
        }
    };

    let stopping = Arc::clone(&monitor);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    if args.metrics {
        println!("{}", metrics.gather_metrics()?);
    }

    match monitor.last_error() {
        Some(e) => bail!("Monitor stopped: {e}"),
        None if ended_early => {
            warn!("Monitor stopped without an error");
            Ok(())
        }
        None => Ok(()),
    }
}

fn log_event(event: &MessageEvent, hex: bool) {
    EventLogger::log_message(
        event.connection.as_str(),
        event.direction.as_str(),
        event.epoch,
        event.payload.len(),
    );
    if hex {
        info!(payload = %hex::encode(&event.payload), "Payload");
    }
}
