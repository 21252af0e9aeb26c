// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per model/operation database query aggregates.

use crate::histogram::NumericHistogram;
use hashbrown::HashMap;
use serde::Serialize;

pub const DEFAULT_HISTOGRAM_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbQueryMetricStats {
    pub model_name: String,
    pub operation: String,
    pub call_count: u64,
    pub call_time: f64,
    pub rows_returned: u64,
    pub min_call_time: f64,
    pub max_call_time: f64,
    pub min_rows_returned: u64,
    pub max_rows_returned: u64,
    pub histogram: NumericHistogram,
}

impl DbQueryMetricStats {
    pub fn new(
        model_name: impl Into<String>,
        operation: impl Into<String>,
        call_count: u64,
        call_time: f64,
        rows_returned: u64,
    ) -> Self {
        let mut histogram = NumericHistogram::new(DEFAULT_HISTOGRAM_SIZE);
        histogram.add(call_time);
        Self {
            model_name: model_name.into(),
            operation: operation.into(),
            call_count,
            call_time,
            rows_returned,
            min_call_time: call_time,
            max_call_time: call_time,
            min_rows_returned: rows_returned,
            max_rows_returned: rows_returned,
            histogram,
        }
    }

    /// `"{model}#{operation}"`
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}#{}", self.model_name, self.operation)
    }

    pub fn combine(&mut self, other: &DbQueryMetricStats) {
        self.call_count += other.call_count;
        self.rows_returned += other.rows_returned;
        self.call_time += other.call_time;
        self.min_call_time = self.min_call_time.min(other.min_call_time);
        self.max_call_time = self.max_call_time.max(other.max_call_time);
        self.min_rows_returned = self.min_rows_returned.min(other.min_rows_returned);
        self.max_rows_returned = self.max_rows_returned.max(other.max_rows_returned);
        self.histogram.combine(&other.histogram);
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DbQueryMetricSet {
    metrics: HashMap<String, DbQueryMetricStats>,
}

impl DbQueryMetricSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stats: DbQueryMetricStats) {
        match self.metrics.get_mut(&stats.key()) {
            Some(existing) => existing.combine(&stats),
            None => {
                self.metrics.insert(stats.key(), stats);
            }
        }
    }

    pub fn combine(&mut self, other: DbQueryMetricSet) {
        for stats in other.metrics.into_values() {
            self.insert(stats);
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&DbQueryMetricStats> {
        self.metrics.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}
