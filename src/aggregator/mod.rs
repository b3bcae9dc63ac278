//! Windowed per-flow byte accounting.
//!
//! Both disciplines emit on an opportunistic ~1s cadence: the tick is only
//! checked when an observation arrives or the pipeline wakes up idle, never
//! by a timer of its own.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::models::domain::{FlowKey, Mode, Observation};

pub mod sliding;
pub mod tumbling;

pub use sliding::SlidingAggregator;
pub use tumbling::TumblingAggregator;

pub const EMIT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    period: Duration,
    last: Instant,
}

impl Ticker {
    pub fn new(start: Instant, period: Duration) -> Self {
        Ticker {
            period,
            last: start,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.period
    }

    pub fn reset(&mut self, now: Instant) {
        self.last = now;
    }
}

/// Point-in-time view of one aggregator's buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub mode: Mode,
    /// Span the totals cover: the epoch length or the sliding window.
    pub window: Duration,
    pub flows: BTreeMap<FlowKey, u64>,
    /// Observations left out of the totals because they had no addresses.
    pub skipped: u64,
    /// Window entries dropped by the retention cap since the last emission.
    pub truncated: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRate<'a> {
    pub key: &'a FlowKey,
    pub bytes: u64,
    pub kbps: f64,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.flows.values().sum()
    }

    /// Flows converted with the mode's kilobit convention, busiest first.
    pub fn rates(&self) -> Vec<FlowRate<'_>> {
        let mut rates: Vec<FlowRate<'_>> = self
            .flows
            .iter()
            .map(|(key, &bytes)| FlowRate {
                key,
                bytes,
                kbps: self.mode.kbps(bytes),
            })
            .collect();
        // BTreeMap order already breaks ties by key
        rates.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        rates
    }
}

pub trait Aggregator {
    fn mode(&self) -> Mode;

    /// Accounts one observation, returning a snapshot if a tick fell due.
    fn on_observation(&mut self, obs: Observation) -> Option<Snapshot>;

    /// Tick check while no traffic is arriving.
    fn on_idle(&mut self, now: Instant) -> Option<Snapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::domain::Address;

    fn key(proto: &str) -> FlowKey {
        FlowKey {
            source: Address::Ip("10.0.0.1".parse().unwrap()),
            destination: Address::Ip("10.0.0.2".parse().unwrap()),
            protocol: proto.to_string(),
        }
    }

    #[test]
    fn test_ticker_cadence() {
        let t0 = Instant::now();
        let mut ticker = Ticker::new(t0, EMIT_INTERVAL);
        assert!(!ticker.is_due(t0 + Duration::from_millis(999)));
        assert!(ticker.is_due(t0 + Duration::from_secs(1)));
        ticker.reset(t0 + Duration::from_millis(1200));
        assert!(!ticker.is_due(t0 + Duration::from_millis(2100)));
        assert!(ticker.is_due(t0 + Duration::from_millis(2200)));
    }

    #[test]
    fn test_rates_are_sorted_busiest_first() {
        let mut flows = BTreeMap::new();
        flows.insert(key("TCP"), 100);
        flows.insert(key("UDP"), 500);
        let snapshot = Snapshot {
            mode: Mode::Sliding,
            window: EMIT_INTERVAL,
            flows,
            skipped: 0,
            truncated: 0,
        };

        let rates = snapshot.rates();
        assert_eq!(rates[0].key.protocol, "UDP");
        assert_eq!(rates[0].kbps, 4.0);
        assert_eq!(rates[1].bytes, 100);
        assert_eq!(snapshot.total_bytes(), 600);
    }
}
