//! Bounded measurement history (spec.md §3 `HistoryData`).
//!
//! A fixed-capacity ring: same shape as the corpus's bounded broadcast
//! channels (`cache.rs`'s `CAP: usize = 256`), but here the data itself is
//! retained (for UI chart replay on `subscribe`) rather than only counted.

use std::collections::{BTreeMap, VecDeque};

/// One measurement sample: a timestamp (ms since epoch) and the named
/// channel values read in that poll tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub measurements: BTreeMap<String, f64>,
}

/// Ring of measurement samples bounded by a maximum sample count.
///
/// Invariant (spec.md §3): `timestamps.len()` equals the count of samples
/// retained, which never exceeds `capacity`, and always equals the count of
/// per-channel series lengths (there is exactly one `Sample` per tick, so a
/// single `VecDeque<Sample>` keeps that invariant by construction instead of
/// requiring parallel-vector bookkeeping).
#[derive(Debug, Clone)]
pub struct HistoryData {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl HistoryData {
    /// `capacity` is the retention window in samples, e.g. for a ~250 ms
    /// poll cadence and a 30 minute window: `30*60*1000/250 = 7200`.
    pub fn new(capacity: usize) -> Self {
        HistoryData {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, timestamp_ms: i64, measurements: BTreeMap<String, f64>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            timestamp_ms,
            measurements,
        });
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    /// A single channel's series across the retained window, in order.
    pub fn series(&self, channel: &str) -> Vec<(i64, f64)> {
        self.samples
            .iter()
            .filter_map(|s| s.measurements.get(channel).map(|v| (s.timestamp_ms, *v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(v: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("voltage".to_owned(), v)])
    }

    #[test]
    fn push_within_capacity_retains_all() {
        let mut h = HistoryData::new(5);
        for i in 0..3 {
            h.push(i, sample(i as f64));
        }
        assert_eq!(h.len(), 3);
    }

    #[test]
    fn push_beyond_capacity_evicts_oldest() {
        let mut h = HistoryData::new(3);
        for i in 0..5 {
            h.push(i, sample(i as f64));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.series("voltage"), vec![(2, 2.0), (3, 3.0), (4, 4.0)]);
    }

    #[test]
    fn latest_reflects_most_recent_push() {
        let mut h = HistoryData::new(3);
        h.push(1, sample(1.0));
        h.push(2, sample(2.0));
        assert_eq!(h.latest().unwrap().timestamp_ms, 2);
    }

    #[test]
    fn series_ignores_missing_channel() {
        let mut h = HistoryData::new(3);
        h.push(1, BTreeMap::from([("current".to_owned(), 1.0)]));
        assert!(h.series("voltage").is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut h = HistoryData::new(0);
        h.push(1, sample(1.0));
        h.push(2, sample(2.0));
        assert_eq!(h.len(), 1);
        assert_eq!(h.latest().unwrap().timestamp_ms, 2);
    }
}
