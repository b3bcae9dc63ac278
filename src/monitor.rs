use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::aggregator::{Aggregator, SlidingAggregator, TumblingAggregator};
use crate::config::{DnsConfig, MonitorConfig};
use crate::error::{MonitorError, Result};
use crate::labeler::{AddressLabeler, CachingResolver, Resolver, SystemResolver};
use crate::models::domain::{Mode, Observation};
use crate::reporter::Reporter;
use crate::sniff::{self, CaptureSource, PcapSource};

/// Cooperative stop signal. Written by whoever asks for the run to end, read
/// by the capture thread and the pipeline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    parent: Option<Box<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that fires with `self` but can also be cancelled on its own
    /// without `self` noticing.
    pub fn child(&self) -> CancelToken {
        CancelToken {
            cancelled: Arc::default(),
            parent: Some(Box::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }
}

/// Cancels on Ctrl-C. Can only be installed once per process.
pub fn cancel_on_ctrlc(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || token.cancel())?;
    Ok(())
}

/// Cancels when a line is read from `input`. The listener ends with its input.
pub fn cancel_on_enter<R>(input: R, token: &CancelToken) -> io::Result<thread::JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    let token = token.clone();
    thread::Builder::new()
        .name("bwmon-stdin".into())
        .spawn(move || {
            let mut lines = input.lines();
            if let Some(Ok(_)) = lines.next() {
                info!("stop requested from keyboard");
                token.cancel();
            }
        })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub observations: u64,
    pub reports: u64,
}

/// Drives one aggregator from the observation stream until cancelled or the
/// stream closes. `poll` bounds how long a tick can go unchecked while idle.
pub fn run_pipeline<W: Write>(
    rx: &Receiver<Observation>,
    aggregator: &mut dyn Aggregator,
    reporter: &mut Reporter<W>,
    cancel: &CancelToken,
    poll: Duration,
) -> Result<PipelineStats> {
    let mut stats = PipelineStats::default();
    while !cancel.is_cancelled() {
        let snapshot = match rx.recv_timeout(poll) {
            Ok(obs) => {
                stats.observations += 1;
                aggregator.on_observation(obs)
            }
            Err(RecvTimeoutError::Timeout) => aggregator.on_idle(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Some(snapshot) = snapshot {
            reporter.report(&snapshot)?;
            stats.reports += 1;
        }
    }
    debug!(
        "{} pipeline stopped: {} observations, {} reports",
        aggregator.mode(),
        stats.observations,
        stats.reports
    );
    Ok(stats)
}

pub fn build_aggregator(config: &MonitorConfig, start: Instant) -> Box<dyn Aggregator> {
    match config.mode {
        Mode::Tumbling => Box::new(TumblingAggregator::new(start)),
        Mode::Sliding => Box::new(SlidingAggregator::new(
            config.window,
            config.max_window_entries,
            start,
        )),
    }
}

pub fn build_labeler(dns: &DnsConfig) -> AddressLabeler {
    if !dns.enabled {
        return AddressLabeler::offline();
    }
    let system = SystemResolver::new(dns.timeout);
    let resolver: Box<dyn Resolver> = match dns.cache_ttl {
        Some(ttl) => Box::new(CachingResolver::new(system, ttl)),
        None => Box::new(system),
    };
    AddressLabeler::new(resolver)
}

/// Runs a monitor over an already opened source and writes reports to `out`.
pub fn monitor_source<S, W>(
    source: S,
    config: &MonitorConfig,
    out: W,
    cancel: &CancelToken,
) -> Result<PipelineStats>
where
    S: CaptureSource + 'static,
    W: Write,
{
    let (tx, rx) = unbounded();
    // ends capture when the pipeline stops; the caller's token is only read
    let shutdown = cancel.child();
    let capture = sniff::start_sniffing(source, tx, shutdown.clone())?;

    let mut reporter = Reporter::new(out, build_labeler(&config.dns), config.format);
    let mut aggregator = build_aggregator(config, Instant::now());

    let outcome = reporter.banner(&config.interface, config.mode).and_then(|_| {
        run_pipeline(
            &rx,
            aggregator.as_mut(),
            &mut reporter,
            cancel,
            config.poll_interval,
        )
    });
    shutdown.cancel();
    drop(rx);

    let captured = capture
        .join()
        .map_err(|_| MonitorError::Io(io::Error::new(io::ErrorKind::Other, "capture thread panicked")))?;
    let stats = outcome?;
    let capture_stats = captured?;
    info!(
        "captured {} frames ({} rejected), produced {} reports",
        capture_stats.frames, capture_stats.rejected, stats.reports
    );
    Ok(stats)
}

/// Opens `config.interface` (or the configured savefile) and monitors it
/// until `cancel` fires. Failing to open the source is fatal and returned
/// immediately.
pub fn run(config: &MonitorConfig, cancel: &CancelToken) -> Result<()> {
    match &config.capture.savefile {
        Some(path) => launch(PcapSource::from_file(path, &config.capture)?, config, cancel),
        None => launch(
            PcapSource::open(&config.interface, &config.capture)?,
            config,
            cancel,
        ),
    }
}

fn launch<S>(source: S, config: &MonitorConfig, cancel: &CancelToken) -> Result<()>
where
    S: CaptureSource + 'static,
{
    if config.stop_on_enter {
        cancel_on_enter(io::BufReader::new(io::stdin()), cancel)?;
    }
    info!(
        "starting {} monitor on {} (window {:?})",
        config.mode, config.interface, config.window
    );
    monitor_source(source, config, io::stdout(), cancel)?;
    Ok(())
}
