//! Per-flow bandwidth monitoring.
//!
//! Frames from a capture source are reduced to [`Observation`]s, keyed by
//! (source, destination, transport) and accounted either in fixed one-second
//! epochs ([`TumblingAggregator`]) or over a trailing window
//! ([`SlidingAggregator`]). Snapshots are written by a [`Reporter`] once per
//! second.

pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod error;
pub mod labeler;
pub mod models;
pub mod monitor;
pub mod parser;
pub mod reporter;
pub mod sniff;

pub use aggregator::{Aggregator, Snapshot, SlidingAggregator, TumblingAggregator};
pub use classifier::classify;
pub use config::{Cli, MonitorConfig, OutputFormat};
pub use error::{ConfigError, ExtractError, MonitorError, Result};
pub use labeler::{AddressLabel, AddressLabeler, Lookup, Resolver};
pub use models::domain::{Address, FlowKey, Mode, Observation, Transport};
pub use monitor::{run, CancelToken};
pub use reporter::Reporter;
pub use sniff::{CaptureSource, IterSource, PcapSource};
