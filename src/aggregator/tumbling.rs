use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, trace};

use super::{Aggregator, Snapshot, Ticker, EMIT_INTERVAL};
use crate::classifier::classify;
use crate::models::domain::{FlowKey, Mode, Observation};

/// Fixed, non-overlapping epochs of at least one second.
///
/// Observations without both addresses are not attributed to any flow; they
/// are counted in [`Snapshot::skipped`] instead.
pub struct TumblingAggregator {
    bucket: HashMap<FlowKey, u64>,
    ticker: Ticker,
    skipped: u64,
}

impl TumblingAggregator {
    pub fn new(start: Instant) -> Self {
        TumblingAggregator {
            bucket: HashMap::new(),
            ticker: Ticker::new(start, EMIT_INTERVAL),
            skipped: 0,
        }
    }

    /// Adds an observation to the current epoch. Returns whether its bytes
    /// were attributed to a flow.
    pub fn ingest(&mut self, obs: &Observation) -> bool {
        if !obs.has_addresses() {
            self.skipped += 1;
            trace!("no IP layer, {} bytes left unattributed", obs.length);
            return false;
        }
        let key = classify(obs, Mode::Tumbling);
        *self.bucket.entry(key).or_insert(0) += obs.length;
        true
    }

    /// Reads the epoch without touching it.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            mode: Mode::Tumbling,
            window: EMIT_INTERVAL,
            flows: self.bucket.iter().map(|(k, &v)| (k.clone(), v)).collect(),
            skipped: self.skipped,
            truncated: 0,
        }
    }

    /// Clears every bucket and starts a new epoch at `now`.
    pub fn reset(&mut self, now: Instant) {
        self.bucket.clear();
        self.skipped = 0;
        self.ticker.reset(now);
    }

    pub fn total_bytes(&self) -> u64 {
        self.bucket.values().sum()
    }

    pub fn flow_count(&self) -> usize {
        self.bucket.len()
    }

    fn emit(&mut self, now: Instant) -> Snapshot {
        let snapshot = self.snapshot();
        debug!(
            "epoch closed: {} flows, {} bytes, {} skipped",
            snapshot.flows.len(),
            snapshot.total_bytes(),
            snapshot.skipped
        );
        self.reset(now);
        snapshot
    }
}

impl Aggregator for TumblingAggregator {
    fn mode(&self) -> Mode {
        Mode::Tumbling
    }

    // The observation that closes an epoch belongs to the next one.
    fn on_observation(&mut self, obs: Observation) -> Option<Snapshot> {
        let emitted = self
            .ticker
            .is_due(obs.timestamp)
            .then(|| self.emit(obs.timestamp));
        self.ingest(&obs);
        emitted
    }

    fn on_idle(&mut self, now: Instant) -> Option<Snapshot> {
        self.ticker.is_due(now).then(|| self.emit(now))
    }
}
