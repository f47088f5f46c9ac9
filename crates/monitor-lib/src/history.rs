//! Bounded per-metric time series
//!
//! Each tracked metric keeps the most recent samples in insertion order.
//! Older samples are evicted once the capacity is reached.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of samples retained per metric
pub const MAX_HISTORY_SAMPLES: usize = 512;

/// A single reading of one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix timestamp in seconds
    pub timestamp: f64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// The daemon reports a zero read time before the first real reading.
    /// Anything that does not land after the first second of the epoch is
    /// treated as that placeholder.
    fn has_reading(&self) -> bool {
        self.timestamp >= 1.0
    }
}

/// Fixed-capacity history of samples for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    /// Create an empty history holding up to [`MAX_HISTORY_SAMPLES`]
    pub fn new() -> Self {
        Self::with_capacity(MAX_HISTORY_SAMPLES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(MAX_HISTORY_SAMPLES)),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest ones beyond capacity.
    ///
    /// Returns false when the sample carries no real reading and was dropped.
    pub fn add(&mut self, sample: Sample) -> bool {
        if !sample.has_reading() {
            return false;
        }

        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        true
    }

    /// Timestamps and values as two parallel vectors, oldest first
    pub fn series_xy(&self) -> (Vec<f64>, Vec<f64>) {
        self.samples
            .iter()
            .map(|sample| (sample.timestamp, sample.value))
            .unzip()
    }

    /// Minimum and maximum value among samples with `from <= timestamp <= until`.
    ///
    /// Returns `(f64::INFINITY, f64::NEG_INFINITY)` when nothing matches;
    /// callers must treat that pair as "no data".
    pub fn range_min_max(&self, from: f64, until: f64) -> (f64, f64) {
        self.in_range(from, until)
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), sample| {
                (min.min(sample.value), max.max(sample.value))
            })
    }

    /// Arithmetic mean of samples with `from <= timestamp <= until`.
    ///
    /// NaN when nothing matches.
    pub fn range_average(&self, from: f64, until: f64) -> f64 {
        let (sum, count) = self
            .in_range(from, until)
            .fold((0.0, 0usize), |(sum, count), sample| (sum + sample.value, count + 1));

        sum / count as f64
    }

    fn in_range(&self, from: f64, until: f64) -> impl Iterator<Item = &Sample> {
        self.samples
            .iter()
            .filter(move |sample| sample.timestamp >= from && sample.timestamp <= until)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    /// Most recently added sample
    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
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
}
