//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (listeners reference existing quotas)
//! - Validate value ranges (addresses parse, water marks are ordered)
//! - Detect duplicate listeners
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: NetmgrConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::{ListenerKind, NetmgrConfig};
use crate::net::http::path_is_valid;

/// One problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `listeners[0].address`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_config(config: &NetmgrConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let t = &config.timeouts;
    for (name, value) in [("init_ms", t.init_ms), ("idle_ms", t.idle_ms), ("keepalive_ms", t.keepalive_ms)] {
        if value == 0 {
            errors.push(ValidationError::new(format!("timeouts.{name}"), "must be greater than 0"));
        }
    }

    let mut quota_names = HashSet::new();
    for (i, quota) in config.quotas.iter().enumerate() {
        if quota.name.is_empty() {
            errors.push(ValidationError::new(format!("quotas[{i}].name"), "must not be empty"));
        } else if !quota_names.insert(quota.name.as_str()) {
            errors.push(ValidationError::new(
                format!("quotas[{i}].name"),
                format!("duplicate quota {:?}", quota.name),
            ));
        }
        if quota.max > 0 && quota.soft > quota.max {
            errors.push(ValidationError::new(format!("quotas[{i}].soft"), "must not exceed max"));
        }
    }

    let mut bound = HashSet::new();
    for (i, listener) in config.listeners.iter().enumerate() {
        let field = |name: &str| format!("listeners[{i}].{name}");

        match listener.address.parse::<SocketAddr>() {
            Ok(addr) => {
                let key = (listener.kind.is_stream(), addr);
                if addr.port() != 0 && !bound.insert(key) {
                    errors.push(ValidationError::new(field("address"), format!("{addr} is already used by another listener")));
                }
            }
            Err(_) => errors.push(ValidationError::new(
                field("address"),
                format!("invalid socket address {:?}", listener.address),
            )),
        }

        if listener.backlog <= 0 {
            errors.push(ValidationError::new(field("backlog"), "must be greater than 0"));
        }
        if listener.kind.needs_tls() && listener.tls.is_none() {
            errors.push(ValidationError::new(field("tls"), "required for this listener kind"));
        }
        if let Some(name) = &listener.quota {
            if listener.kind == ListenerKind::Udp {
                errors.push(ValidationError::new(field("quota"), "UDP listeners take no quota"));
            } else if config.quota(name).is_none() {
                errors.push(ValidationError::new(field("quota"), format!("unknown quota {name:?}")));
            }
        }
        if listener.kind == ListenerKind::Http {
            if listener.endpoints.is_empty() {
                errors.push(ValidationError::new(field("endpoints"), "at least one path is required"));
            }
            for path in &listener.endpoints {
                if !path_is_valid(path) {
                    errors.push(ValidationError::new(field("endpoints"), format!("invalid path {path:?}")));
                }
            }
        }
    }

    if config.memory.hi_water > 0 && config.memory.lo_water > config.memory.hi_water {
        errors.push(ValidationError::new("memory.lo_water", "must not exceed hi_water"));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new("observability.metrics_address", "invalid socket address"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
