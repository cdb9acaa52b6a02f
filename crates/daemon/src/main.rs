use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use iphonedisk_daemon::config::Config;
use iphonedisk_daemon::mount::{DetachPolicy, FailurePolicy};
use iphonedisk_daemon::{build_info, logging, process, ShutdownHandle};

/// Mount an attached device's storage as a local filesystem
#[derive(Parser, Debug)]
#[command(name = "iphonediskd", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, short, env = "IPHONEDISK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory the filesystem is mounted at
    #[arg(long, env = "IPHONEDISK_MOUNT_POINT")]
    mount_point: Option<PathBuf>,

    /// Directory whose presence means the device is attached
    #[arg(long, env = "IPHONEDISK_DEVICE_PATH")]
    device_path: Option<PathBuf>,

    /// Service identifier opened on the device
    #[arg(long, env = "IPHONEDISK_SERVICE")]
    service: Option<String>,

    #[arg(long, env = "IPHONEDISK_READ_ONLY")]
    read_only: bool,

    /// Pass the debug option to the filesystem layer
    #[arg(long, env = "IPHONEDISK_DEBUG")]
    debug: bool,

    /// Keep retrying failed mounts instead of exiting
    #[arg(long, env = "IPHONEDISK_RETRY")]
    retry: bool,

    /// Enter the filesystem loop even if the device detached while mounting
    #[arg(long, env = "IPHONEDISK_IGNORE_EARLY_DETACH")]
    ignore_early_detach: bool,

    /// Seconds to wait for the filesystem loop before forcing an unmount
    #[arg(long, env = "IPHONEDISK_UNMOUNT_TIMEOUT")]
    unmount_timeout: Option<u64>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, env = "IPHONEDISK_LOG_LEVEL")]
    log_level: Option<String>,

    /// Also write logs to a daily rotated file in this directory
    #[arg(long, env = "IPHONEDISK_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn apply(self, mut config: Config) -> Config {
        if let Some(mount_point) = self.mount_point {
            config.mount_point = mount_point;
        }
        if let Some(device_path) = self.device_path {
            config.device_path = device_path;
        }
        if let Some(service) = self.service {
            config.service = service;
        }
        if self.read_only {
            config.read_only = true;
        }
        if self.debug {
            config.debug = true;
        }
        if self.retry && config.failure_policy == FailurePolicy::Exit {
            config.failure_policy = FailurePolicy::Retry {
                initial_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
            };
        }
        if self.ignore_early_detach {
            config.detach_policy = DetachPolicy::Ignore;
        }
        if let Some(secs) = self.unmount_timeout {
            config.unmount_timeout_secs = secs;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        if let Some(dir) = self.log_dir {
            config.log.directory = Some(dir);
        }
        config
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => cli.apply(config),
        Err(e) => {
            eprintln!("iphonediskd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = logging::init(&config.log);
    tracing::info!(build = %build_info(), "Starting");

    match run(config).await {
        Ok(()) => {
            tracing::info!("Exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let service = process::spawn_service(&config)?;
    tokio::spawn(forward_signals(service.shutdown_handle()));

    tokio::task::spawn_blocking(move || service.wait()).await??;
    Ok(())
}

/// Request a graceful shutdown on SIGINT or SIGTERM
async fn forward_signals(shutdown: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
                shutdown.shutdown();
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl-C");
    }

    shutdown.shutdown();
}
