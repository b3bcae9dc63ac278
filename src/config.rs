use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::aggregator::sliding::DEFAULT_MAX_ENTRIES;
use crate::error::ConfigError;
use crate::models::domain::Mode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Per-flow bandwidth monitor.
///
/// Every flag can also be set through a `BWMON_*` variable, including from a `.env` file.
#[derive(Debug, Parser)]
#[command(name = "bwmon", version, about)]
pub struct Cli {
    /// Network interface
    #[arg(short, long, env = "BWMON_INTERFACE")]
    pub interface: String,

    /// Enable sliding-window detailed mode
    #[arg(long, env = "BWMON_DETAILED")]
    pub detailed: bool,

    /// Time window (seconds)
    #[arg(short, long, default_value_t = 1.0, env = "BWMON_WINDOW")]
    pub window: f64,

    /// Upper bound on observations retained by the sliding window
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES, env = "BWMON_MAX_WINDOW_ENTRIES")]
    pub max_window_entries: usize,

    /// Reverse DNS deadline per lookup (milliseconds)
    #[arg(long, default_value_t = 500, env = "BWMON_DNS_TIMEOUT_MS")]
    pub dns_timeout_ms: u64,

    /// How long reverse DNS answers are reused (seconds, 0 disables)
    #[arg(long, default_value_t = 60, env = "BWMON_DNS_CACHE_TTL")]
    pub dns_cache_ttl: u64,

    /// Never perform reverse DNS lookups
    #[arg(long, env = "BWMON_NO_DNS")]
    pub no_dns: bool,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text, env = "BWMON_FORMAT")]
    pub format: OutputFormat,

    /// Stop when ENTER is pressed
    #[arg(long, env = "BWMON_STOP_ON_ENTER")]
    pub stop_on_enter: bool,

    /// Put the interface in promiscuous mode
    #[arg(long, env = "BWMON_PROMISC")]
    pub promisc: bool,

    #[arg(long, default_value_t = 2048, env = "BWMON_SNAPLEN")]
    pub snaplen: i32,

    /// BPF filter applied by the capture device
    #[arg(long, env = "BWMON_FILTER")]
    pub filter: Option<String>,

    /// Replay a pcap savefile instead of capturing live; the interface only names the run
    #[arg(short = 'r', long, env = "BWMON_READ_FILE")]
    pub read_file: Option<PathBuf>,

    /// How long the pipeline waits for traffic before re-checking the tick (milliseconds)
    #[arg(long, default_value_t = 100, env = "BWMON_POLL_MS")]
    pub poll_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub interface: String,
    pub mode: Mode,
    pub window: Duration,
    pub max_window_entries: usize,
    pub dns: DnsConfig,
    pub format: OutputFormat,
    pub stop_on_enter: bool,
    pub capture: CaptureConfig,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DnsConfig {
    pub enabled: bool,
    pub timeout: Duration,
    /// `None` disables the cache.
    pub cache_ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub promisc: bool,
    pub snaplen: i32,
    pub filter: Option<String>,
    /// Read timeout so the capture thread can notice cancellation.
    pub read_timeout_ms: i32,
    pub savefile: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            promisc: false,
            snaplen: 2048,
            filter: None,
            read_timeout_ms: 500,
            savefile: None,
        }
    }
}

impl MonitorConfig {
    /// Configuration with defaults for everything but the three launch parameters.
    pub fn new(interface: &str, detailed: bool, window_secs: f64) -> Result<Self, ConfigError> {
        let interface = interface.trim();
        if interface.is_empty() {
            return Err(ConfigError::EmptyInterface);
        }
        Ok(MonitorConfig {
            interface: interface.to_string(),
            mode: if detailed { Mode::Sliding } else { Mode::Tumbling },
            window: window_duration(window_secs)?,
            max_window_entries: DEFAULT_MAX_ENTRIES,
            dns: DnsConfig {
                enabled: true,
                timeout: Duration::from_millis(500),
                cache_ttl: Some(Duration::from_secs(60)),
            },
            format: OutputFormat::Text,
            stop_on_enter: false,
            capture: CaptureConfig::default(),
            poll_interval: Duration::from_millis(100),
        })
    }
}

fn window_duration(secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::InvalidWindow(secs));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidWindow(secs))
}

impl TryFrom<Cli> for MonitorConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.max_window_entries == 0 {
            return Err(ConfigError::ZeroWindowCap);
        }
        let mut config = MonitorConfig::new(&cli.interface, cli.detailed, cli.window)?;
        config.max_window_entries = cli.max_window_entries;
        config.dns = DnsConfig {
            enabled: !cli.no_dns,
            timeout: Duration::from_millis(cli.dns_timeout_ms),
            cache_ttl: (cli.dns_cache_ttl > 0).then(|| Duration::from_secs(cli.dns_cache_ttl)),
        };
        config.format = cli.format;
        config.stop_on_enter = cli.stop_on_enter;
        config.capture.promisc = cli.promisc;
        config.capture.snaplen = cli.snaplen;
        config.capture.filter = cli.filter.filter(|f| !f.trim().is_empty());
        config.capture.savefile = cli.read_file;
        config.poll_interval = Duration::from_millis(cli.poll_ms.max(1));
        Ok(config)
    }
}
