//! Error types for genlock, frame delivery and worker supervision.
//!
//! All fallible operations in this crate return [`Result`], whose error type is
//! [`FrameLockError`]. Errors carry structured context and can be classified for
//! recovery:
//!
//! ```rust
//! use framelock::FrameLockError;
//!
//! let error = FrameLockError::invalid_address("genlock-host", "missing port");
//! if !error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! ## Error Categories
//!
//! - **Transport**: socket bind/send/receive failures
//! - **Configuration**: invalid modes, addresses or YAML documents
//! - **Process lifecycle**: worker launch failures and exhausted restart budgets
//!
//! Integrity failures (corrupt sync packets) and liveness failures (watchdog
//! timeouts) are deliberately not represented here: the former are counted and
//! discarded, the latter terminate the process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for framelock operations.
pub type Result<T, E = FrameLockError> = std::result::Result<T, E>;

/// Main error type for framelock operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FrameLockError {
    #[error("Failed to bind genlock socket to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Genlock transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid peer address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration parse error: {details}")]
    Config { details: String },

    #[error("Failed to launch worker {}", .binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown stream '{stream}'")]
    UnknownStream { stream: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Worker '{stream}' gave up after {attempts} restart attempts: {last_error}")]
    RestartLimit { stream: String, attempts: u32, last_error: String },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Component is shut down: {component}")]
    Closed { component: String },
}

impl FrameLockError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            FrameLockError::Bind { .. } => true,
            FrameLockError::Transport { .. } => true,
            FrameLockError::Launch { .. } => true,
            FrameLockError::Timeout { .. } => true,
            FrameLockError::Io { .. } => true,
            FrameLockError::InvalidAddress { .. } => false,
            FrameLockError::InvalidConfig { .. } => false,
            FrameLockError::Config { .. } => false,
            FrameLockError::UnknownStream { .. } => false,
            FrameLockError::RestartLimit { .. } => false,
            FrameLockError::Closed { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            FrameLockError::Bind { .. } => vec![
                "Check that no other process is bound to the genlock port",
                "Verify the interface address exists on this host",
                "Pick a different genlock port",
            ],
            FrameLockError::Transport { .. } => vec![
                "Check network connectivity between reference and followers",
                "Verify firewall rules allow UDP on the genlock port",
            ],
            FrameLockError::InvalidAddress { .. } => vec![
                "Use the form host:port, e.g. 127.0.0.1:5960",
                "Use a numeric IPv4 or IPv6 address",
            ],
            FrameLockError::InvalidConfig { .. } | FrameLockError::Config { .. } => vec![
                "Check the configuration file for typos",
                "Compare against the documented defaults",
            ],
            FrameLockError::Launch { .. } => vec![
                "Check the worker binary path exists and is executable",
                "Verify the working directory and environment",
            ],
            FrameLockError::UnknownStream { .. } => vec!["Add the stream before addressing it"],
            FrameLockError::Timeout { .. } => vec![
                "Increase the timeout duration",
                "Check system load",
            ],
            FrameLockError::RestartLimit { .. } => vec![
                "Inspect the worker's last error and diagnostic output",
                "Fix the underlying fault and start the worker again",
            ],
            FrameLockError::Io { .. } => vec!["Check file permissions and paths"],
            FrameLockError::Closed { .. } => vec!["Create a new instance after shutdown"],
        }
    }

    /// Helper constructor for socket bind failures.
    pub fn bind_failed(addr: SocketAddr, source: std::io::Error) -> Self {
        FrameLockError::Bind { addr, source }
    }

    /// Helper constructor for transport errors with an underlying I/O error.
    pub fn transport(context: impl Into<String>, source: std::io::Error) -> Self {
        FrameLockError::Transport { context: context.into(), source: Some(source) }
    }

    /// Helper constructor for peer address errors.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        FrameLockError::InvalidAddress { address: address.into(), reason: reason.into() }
    }

    /// Helper constructor for configuration validation errors.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        FrameLockError::InvalidConfig { field: field.into(), reason: reason.into() }
    }

    /// Helper constructor for worker launch failures.
    pub fn launch_failed(binary: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FrameLockError::Launch { binary: binary.into(), source }
    }

    /// Helper constructor for I/O errors with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        FrameLockError::Io { context: context.into(), source }
    }

    /// Helper constructor for a wait that ran out of time.
    pub fn timeout(duration: Duration) -> Self {
        FrameLockError::Timeout { duration }
    }

    /// Helper constructor for operations on a component that has shut down.
    pub fn closed(component: impl Into<String>) -> Self {
        FrameLockError::Closed { component: component.into() }
    }
}

impl From<serde_yaml_ng::Error> for FrameLockError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        FrameLockError::Config { details: err.to_string() }
    }
}
