//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NetmgrConfig (validated, immutable)
//!     → lifecycle::startup builds the manager and listeners from it
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → manager paused, settings applied, manager resumed
//! ```
//!
//! # Design Decisions
//! - Only manager settings (timeouts, buffers, max_udp) and quota limits
//!   are reloadable; listener changes need a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, ConfigError};
pub use schema::{ListenerConfig, ListenerKind, NetmgrConfig};
