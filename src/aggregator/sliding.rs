use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Aggregator, Snapshot, Ticker, EMIT_INTERVAL};
use crate::classifier::classify;
use crate::models::domain::{FlowKey, Mode, Observation};

/// Retention cap applied on top of time-based eviction.
pub const DEFAULT_MAX_ENTRIES: usize = 1_000_000;

#[derive(Debug, Clone)]
struct WindowEntry {
    timestamp: Instant,
    key: FlowKey,
    length: u64,
}

/// Trailing-window totals, reported every second whatever the window length.
///
/// Totals are rebuilt from the retained entries after every change instead of
/// being maintained incrementally.
pub struct SlidingAggregator {
    window: Duration,
    max_entries: usize,
    entries: VecDeque<WindowEntry>,
    totals: HashMap<FlowKey, u64>,
    ticker: Ticker,
    truncated: u64,
}

impl SlidingAggregator {
    pub fn new(window: Duration, max_entries: usize, start: Instant) -> Self {
        SlidingAggregator {
            window,
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
            totals: HashMap::new(),
            ticker: Ticker::new(start, EMIT_INTERVAL),
            truncated: 0,
        }
    }

    /// Appends an observation, evicts against its timestamp and rebuilds the totals.
    pub fn push(&mut self, obs: &Observation) {
        self.entries.push_back(WindowEntry {
            timestamp: obs.timestamp,
            key: classify(obs, Mode::Sliding),
            length: obs.length,
        });
        self.evict(obs.timestamp);
        self.enforce_cap();
        self.recompute();
    }

    /// Drops every entry older than `now - window`. Returns whether any went.
    pub fn evict(&mut self, now: Instant) -> bool {
        let cutoff = match now.checked_sub(self.window) {
            Some(cutoff) => cutoff,
            None => return false,
        };
        let before = self.entries.len();
        self.entries.retain(|e| e.timestamp >= cutoff);
        self.entries.len() != before
    }

    fn enforce_cap(&mut self) {
        let excess = self.entries.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return;
        }
        if self.truncated == 0 {
            warn!(
                "sliding window exceeded {} entries, dropping oldest observations",
                self.max_entries
            );
        }
        self.entries.drain(..excess);
        self.truncated += excess as u64;
    }

    fn recompute(&mut self) {
        let mut totals = HashMap::with_capacity(self.totals.len());
        for entry in &self.entries {
            *totals.entry(entry.key.clone()).or_insert(0) += entry.length;
        }
        self.totals = totals;
    }

    pub fn totals(&self) -> &HashMap<FlowKey, u64> {
        &self.totals
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            mode: Mode::Sliding,
            window: self.window,
            flows: self.totals.iter().map(|(k, &v)| (k.clone(), v)).collect(),
            skipped: 0,
            truncated: self.truncated,
        }
    }

    fn emit(&mut self, now: Instant) -> Snapshot {
        if self.evict(now) {
            self.recompute();
        }
        let snapshot = self.snapshot();
        debug!(
            "window of {:?}: {} entries, {} flows",
            self.window,
            self.entries.len(),
            snapshot.flows.len()
        );
        self.truncated = 0;
        self.ticker.reset(now);
        snapshot
    }
}

impl Aggregator for SlidingAggregator {
    fn mode(&self) -> Mode {
        Mode::Sliding
    }

    fn on_observation(&mut self, obs: Observation) -> Option<Snapshot> {
        self.push(&obs);
        self.ticker
            .is_due(obs.timestamp)
            .then(|| self.emit(obs.timestamp))
    }

    fn on_idle(&mut self, now: Instant) -> Option<Snapshot> {
        self.ticker.is_due(now).then(|| self.emit(now))
    }
}
