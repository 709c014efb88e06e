//! Daemon lifecycle.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Configure manager → Build quotas and TLS → Start listeners
//!
//! Reload (signals.rs, config watcher):
//!     SIGHUP or file change → pause workers → apply settings → resume
//!
//! Shutdown (shutdown.rs, signals.rs):
//!     SIGTERM/SIGINT → stop listeners → destroy manager → exit
//! ```
//!
//! # Design Decisions
//! - Listeners start last, after every setting is in place
//! - Settings and quota limits change on reload; listeners do not

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{Signal, Signals};
pub use startup::{apply_settings, configure_manager, start_listeners, Running, StartupError};
