use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use meter_proto::config::Config;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use meter_daemon::backoff::BackoffPolicy;
use meter_daemon::playback::PlaybackState;
use meter_daemon::poller;
use meter_daemon::sink::ProcessLauncher;
use meter_daemon::supervisor::Supervisor;

/// Drive analog meter needles through a sound card.
#[derive(Debug, Parser)]
#[command(name = "meterd", version)]
struct Cli {
    /// Config file (default: ~/.config/meter/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured output device
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Debug, Clone, Subcommand)]
enum Mode {
    /// Show CPU/RAM usage on the channels that have a metric (default)
    Run,
    /// Hold one channel at a percentage
    Hold {
        #[arg(long, default_value_t = 0)]
        channel: usize,
        #[arg(long)]
        percent: f64,
    },
    /// Step through the calibration breakpoints
    Sweep {
        /// Only this channel (default: every channel in turn)
        #[arg(long)]
        channel: Option<usize>,
        #[arg(long, default_value_t = 2000)]
        step_ms: u64,
    },
    /// Random values on every channel
    Random {
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// List output devices known to the sink program
    Devices,
}

fn init_logging() -> anyhow::Result<PathBuf> {
    let data_dir = meter_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("meterd.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // File gets everything the filter lets through; the terminal gets a
    // compact copy so `hold`/`sweep` progress is visible while calibrating.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("info,meter_daemon=debug,meterd=debug")
                }),
        )
        .init();

    Ok(log_path)
}

fn load_config(path: &Path, device: Option<&str>) -> anyhow::Result<Config> {
    let mut config = Config::load_from(path)?;
    if let Some(device) = device {
        config.audio.device = device.to_string();
    }
    Ok(config)
}

/// Re-read the config file on SIGHUP and hand it to the running supervisor.
/// A broken file is reported and the previous config kept.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    path: PathBuf,
    device: Option<String>,
    config_tx: watch::Sender<Config>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            match load_config(&path, device.as_deref()) {
                Ok(config) => {
                    info!("Config reloaded from {:?}", path);
                    config_tx.send_replace(config);
                }
                Err(e) => warn!("Config reload failed, keeping previous: {:#}", e),
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = init_logging()?;
    info!("Log file: {:?}", log_path);

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);
    let config = load_config(&config_path, cli.device.as_deref())?;
    info!("Config loaded from: {:?}", config_path);

    let mode = cli.mode.clone().unwrap_or(Mode::Run);
    if let Mode::Devices = mode {
        for device in meter_proto::platform::list_audio_devices(&config.sink.program)? {
            println!("{}", device);
        }
        return Ok(());
    }

    let backoff = BackoffPolicy::from_config(&config.sink);
    let (config_tx, config_rx) = watch::channel(config);
    let mut supervisor = Supervisor::new(ProcessLauncher, PlaybackState::new(config_rx), backoff);
    let playback = supervisor.playback().clone();

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                ctrl_c.cancel();
            }
            Err(e) => error!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    #[cfg(unix)]
    spawn_reload_on_hangup(config_path, cli.device.clone(), config_tx, cancel.clone())?;
    #[cfg(not(unix))]
    let _config_tx = config_tx;

    let mut status = supervisor.subscribe();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            match current.last_error {
                Some(e) if current.failures > 0 => info!(
                    "Sink [{}] failures={} last error: {}",
                    current.state.label(),
                    current.failures,
                    e
                ),
                _ => info!("Sink [{}]", current.state.label()),
            }
        }
    });
    supervisor.start();

    let result = match mode {
        Mode::Run => poller::run_metrics(&playback, cancel.clone()).await,
        Mode::Hold { channel, percent } => {
            poller::hold(&playback, channel, percent, cancel.clone()).await
        }
        Mode::Sweep { channel, step_ms } => {
            poller::sweep(&playback, channel, Duration::from_millis(step_ms), cancel.clone()).await
        }
        Mode::Random { interval_ms } => {
            poller::random(&playback, Duration::from_millis(interval_ms), cancel.clone()).await
        }
        Mode::Devices => Ok(()),
    };

    cancel.cancel();
    supervisor.stop().await;
    let status = supervisor.status();
    info!(
        "Sink launched {} times, {} failures; last target {:?}",
        status.launches,
        status.failures,
        playback.now_playing().values()
    );

    result
}
