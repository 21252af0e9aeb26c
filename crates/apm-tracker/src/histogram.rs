// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming approximate histogram with a fixed number of bins.
//!
//! Each bin is a `(value, count)` centroid. When a new value would push the
//! bin count over the limit, the two closest adjacent bins are merged into
//! their count-weighted mean. Quantiles are then answered by walking the
//! sorted bins.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramBin {
    pub value: f64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NumericHistogram {
    max_bins: usize,
    bins: Vec<HistogramBin>,
    total: u64,
}

impl NumericHistogram {
    #[must_use]
    pub fn new(max_bins: usize) -> Self {
        Self {
            max_bins: max_bins.max(1),
            bins: Vec::with_capacity(max_bins.saturating_add(1)),
            total: 0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.total += 1;

        match self
            .bins
            .binary_search_by(|bin| bin.value.total_cmp(&value))
        {
            Ok(idx) => self.bins[idx].count += 1,
            Err(idx) => {
                self.bins.insert(idx, HistogramBin { value, count: 1 });
                self.trim();
            }
        }
    }

    /// Value below which `q` percent of observations fall.
    ///
    /// Returns 0 for an empty histogram.
    #[must_use]
    pub fn quantile(&self, q: f64) -> f64 {
        let mut count = q / 100.0 * self.total as f64;
        for bin in &self.bins {
            count -= bin.count as f64;
            if count <= 0.0 {
                return bin.value;
            }
        }
        self.bins.last().map_or(0.0, |bin| bin.value)
    }

    /// Percentage (0 to 100) of observations strictly below `value`.
    ///
    /// An empty histogram has nothing to compare against and reports 100.
    #[must_use]
    pub fn approximate_quantile_of_value(&self, value: f64) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let below: u64 = self
            .bins
            .iter()
            .take_while(|bin| bin.value < value)
            .map(|bin| bin.count)
            .sum();
        below as f64 / self.total as f64 * 100.0
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .bins
            .iter()
            .map(|bin| bin.value * bin.count as f64)
            .sum();
        sum / self.total as f64
    }

    pub fn combine(&mut self, other: &NumericHistogram) {
        self.bins.extend_from_slice(&other.bins);
        self.bins.sort_by(|a, b| a.value.total_cmp(&b.value));
        // Identical centroids from both sides collapse into one bin
        self.bins.dedup_by(|later, earlier| {
            if later.value == earlier.value {
                earlier.count += later.count;
                true
            } else {
                false
            }
        });
        self.total += other.total;
        self.trim();
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    #[must_use]
    pub fn bins(&self) -> &[HistogramBin] {
        &self.bins
    }

    fn trim(&mut self) {
        while self.bins.len() > self.max_bins {
            let mut closest = 0;
            let mut min_delta = f64::INFINITY;
            for (idx, pair) in self.bins.windows(2).enumerate() {
                let delta = pair[1].value - pair[0].value;
                if delta < min_delta {
                    min_delta = delta;
                    closest = idx;
                }
            }

            let right = self.bins.remove(closest + 1);
            let left = &mut self.bins[closest];
            let count = left.count + right.count;
            left.value =
                (left.value * left.count as f64 + right.value * right.count as f64) / count as f64;
            left.count = count;
        }
    }
}
