//! Error types for bwmon.
//!
//! Only [`MonitorError`] ever ends a run. [`ExtractError`] is produced per
//! captured frame and is absorbed by the capture thread.

use thiserror::Error;

/// Fatal errors surfaced by [`crate::monitor::run`].
#[derive(Error, Debug)]
pub enum MonitorError {
    /// The capture device could not be opened or configured
    #[error("capture source unavailable: {0}")]
    Capture(#[from] pcap::Error),

    #[error("no capture device named {0:?}")]
    NoSuchDevice(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Writing the report stream failed
    #[error("report output failed: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a structured snapshot failed
    #[error("snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The Ctrl-C handler could not be installed
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// Rejected configuration values.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("window must be a finite number of seconds greater than zero, got {0}")]
    InvalidWindow(f64),

    #[error("max window entries must be greater than zero")]
    ZeroWindowCap,

    #[error("interface name must not be empty")]
    EmptyInterface,
}

/// Per-frame extraction failures. Never fatal.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractError {
    #[error("frame too short for its link header")]
    Truncated,

    /// The on-wire length cannot be trusted, so the frame cannot be accounted.
    #[error("malformed length: wire {wire} bytes, captured {captured} bytes")]
    MalformedLength { wire: u32, captured: u32 },

    #[error("unsupported link type {0}")]
    UnsupportedLinkType(i32),
}

/// Result type alias for fatal monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
