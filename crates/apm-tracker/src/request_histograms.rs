// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::histogram::NumericHistogram;
use hashbrown::HashMap;
use std::sync::Mutex;

/// Process-wide latency histograms keyed by transaction name.
#[derive(Debug)]
pub struct RequestHistograms {
    buckets: usize,
    histograms: Mutex<HashMap<String, NumericHistogram>>,
}

impl RequestHistograms {
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets,
            histograms: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, name: &str, value: f64) {
        #[allow(clippy::expect_used)]
        let mut histograms = self.histograms.lock().expect("lock poisoned");
        histograms
            .entry_ref(name)
            .or_insert_with(|| NumericHistogram::new(self.buckets))
            .add(value);
    }

    /// Percentage of recorded values for `name` below `value`; 100 when unseen.
    #[must_use]
    pub fn approximate_quantile_of_value(&self, name: &str, value: f64) -> f64 {
        #[allow(clippy::expect_used)]
        let histograms = self.histograms.lock().expect("lock poisoned");
        histograms
            .get(name)
            .map_or(100.0, |hist| hist.approximate_quantile_of_value(value))
    }

    #[must_use]
    pub fn quantile(&self, name: &str, q: f64) -> f64 {
        #[allow(clippy::expect_used)]
        let histograms = self.histograms.lock().expect("lock poisoned");
        histograms.get(name).map_or(0.0, |hist| hist.quantile(q))
    }

    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<NumericHistogram> {
        #[allow(clippy::expect_used)]
        let histograms = self.histograms.lock().expect("lock poisoned");
        histograms.get(name).cloned()
    }

    pub fn reset_all(&self) {
        #[allow(clippy::expect_used)]
        let mut histograms = self.histograms.lock().expect("lock poisoned");
        histograms.clear();
    }
}
