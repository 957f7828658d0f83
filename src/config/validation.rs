//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, ports valid, addresses parse)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    InvalidBindAddress(String),

    #[error("listener.max_connections must be greater than zero")]
    ZeroMaxConnections,

    #[error("tunnel.max_request_bytes must be at least {min} bytes, got {actual}")]
    RequestBufferTooSmall { min: usize, actual: usize },

    #[error("tunnel.chunk_size must be greater than zero")]
    ZeroChunkSize,

    #[error("tunnel.allowed_ports contains port 0")]
    ZeroAllowedPort,

    #[error("timeouts.connect_secs must be greater than zero when set")]
    ZeroConnectTimeout,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Shortest request that can possibly be valid: `CONNECT a:1 X\r\n\r\n`.
const MIN_REQUEST_BYTES: usize = 18;

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if config.tunnel.max_request_bytes < MIN_REQUEST_BYTES {
        errors.push(ValidationError::RequestBufferTooSmall {
            min: MIN_REQUEST_BYTES,
            actual: config.tunnel.max_request_bytes,
        });
    }
    if config.tunnel.chunk_size == 0 {
        errors.push(ValidationError::ZeroChunkSize);
    }
    if config.tunnel.allowed_ports.contains(&0) {
        errors.push(ValidationError::ZeroAllowedPort);
    }

    if config.timeouts.connect_secs == Some(0) {
        errors.push(ValidationError::ZeroConnectTimeout);
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
