//! OS signal handling.
//!
//! SIGINT and SIGTERM ask for shutdown, SIGHUP for a configuration reload.
//! Off unix only Ctrl-C is available.

/// What a received signal asks the daemon to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Reload,
}

/// Registered signal streams. Create once and poll with [`Signals::recv`]
/// so that no signal is lost between polls.
#[derive(Debug)]
pub struct Signals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    /// Register handlers. Needs a running tokio runtime.
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                terminate: signal(SignalKind::terminate())?,
                interrupt: signal(SignalKind::interrupt())?,
                hangup: signal(SignalKind::hangup())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> Signal {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.terminate.recv() => {
                    tracing::info!("SIGTERM received");
                    Signal::Shutdown
                }
                _ = self.interrupt.recv() => {
                    tracing::info!("SIGINT received");
                    Signal::Shutdown
                }
                _ = self.hangup.recv() => {
                    tracing::info!("SIGHUP received");
                    Signal::Reload
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not wait for Ctrl-C");
            }
            Signal::Shutdown
        }
    }
}
