//! netmgrd: DNS echo daemon on top of the network manager.
//!
//! Every configured listener answers each message with the message itself,
//! which makes the daemon a convenient target for `nm-cli` and for load
//! tests of the transports.
//!
//! ```text
//!     config (TOML) ──▶ configure_manager ──▶ start_listeners
//!                                                  │
//!     UDP / TCP / TLS / TCPDNS / TLSDNS / DoH ─────┘──▶ echo
//!
//!     SIGHUP / file change ──▶ pause ─▶ apply settings ─▶ resume
//!     SIGINT / SIGTERM     ──▶ stop listeners ─▶ destroy manager
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;

use netmgr::config::watcher::ConfigWatcher;
use netmgr::config::{load_config, NetmgrConfig};
use netmgr::lifecycle::{self, Running, Shutdown, Signal, Signals};
use netmgr::observability::{logging, metrics};
use netmgr::{Handle, Manager, NetError, RecvCb};

#[derive(Parser)]
#[command(name = "netmgrd")]
#[command(about = "Echo daemon for the DNS network manager", long_about = None)]
struct Args {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(short, long, default_value = "netmgr.toml")]
    config: PathBuf,

    /// Log level; overrides the configuration file.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn echo() -> RecvCb {
    Arc::new(|handle: &Handle, result: netmgr::Result<&[u8]>| match result {
        Ok(message) => handle.send(Bytes::copy_from_slice(message), |handle, result| {
            if let Err(e) = result {
                tracing::debug!(peer = %handle.peer_addr(), error = %e, "Echo send failed");
            }
        }),
        Err(NetError::Eof | NetError::Canceled | NetError::ShuttingDown) => {}
        Err(e) => tracing::debug!(peer = %handle.peer_addr(), error = %e, "Receive failed"),
    })
}

fn reload(manager: &Manager, running: &Running, config: &NetmgrConfig) {
    manager.pause();
    lifecycle::apply_settings(manager, config);
    running.apply_quotas(config);
    manager.resume();
    tracing::info!("Configuration reloaded");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = if args.config.exists() {
        load_config(&args.config)?
    } else {
        NetmgrConfig::default()
    };
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init(level);

    tracing::info!(
        config = %args.config.display(),
        workers = config.worker_count(),
        listeners = config.listeners.len(),
        "netmgrd starting"
    );
    if !args.config.exists() {
        tracing::warn!(path = %args.config.display(), "Config file not found; using defaults");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let manager = lifecycle::configure_manager(&config)?;
    let running = Arc::new(lifecycle::start_listeners(&manager, &config, echo())?);

    let shutdown = Shutdown::new();
    let (watcher, mut updates) = ConfigWatcher::new(&args.config);
    let _watcher = if args.config.exists() {
        match watcher.run() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "Config watcher unavailable; reload with SIGHUP");
                None
            }
        }
    } else {
        None
    };

    let reloader = {
        let manager = manager.clone();
        let running = running.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    update = updates.recv() => match update {
                        Some(config) => reload(&manager, &running, &config),
                        None => stop.recv().await,
                    },
                }
            }
        })
    };

    let mut signals = Signals::new()?;
    loop {
        match signals.recv().await {
            Signal::Shutdown => break,
            Signal::Reload => match load_config(&args.config) {
                Ok(config) => reload(&manager, &running, &config),
                Err(e) => tracing::error!(error = %e, "Reload failed; keeping current configuration"),
            },
        }
    }

    tracing::info!("Shutting down");
    shutdown.trigger();
    if let Err(e) = reloader.await {
        tracing::error!(error = %e, "Reload task failed");
    }
    running.stop();
    drop(running);
    tokio::task::spawn_blocking(move || manager.destroy()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
