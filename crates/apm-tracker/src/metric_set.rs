// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::metric::{serialize_metric_map, MetricMap, MetricMeta, MetricStats};
use serde::Serialize;

/// Metric types reported exactly as tracked instead of rolled into `{type}/all`.
pub const PASSTHROUGH_METRICS: [&str; 5] =
    ["CPU", "Memory", "Instance", "Controller", "SlowTransaction"];

/// Reporting-period aggregate of tracked metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricSet {
    #[serde(serialize_with = "serialize_metric_map")]
    metrics: MetricMap,
}

impl MetricSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb_all(&mut self, metrics: &MetricMap) {
        for (meta, stats) in metrics {
            self.absorb(meta, stats);
        }
    }

    pub fn absorb(&mut self, meta: &MetricMeta, stats: &MetricStats) {
        let metric_type = meta.metric_type();

        if PASSTHROUGH_METRICS.contains(&metric_type) {
            self.combine_into(meta.clone(), stats);
        } else if metric_type == "Errors" {
            // Errors keep both the raw metric and a request-wide total
            self.combine_into(meta.clone(), stats);
            let total = MetricMeta::new("Errors/Request").with_scope(meta.scope.clone());
            self.combine_into(total, stats);
        } else {
            let rollup =
                MetricMeta::new(format!("{metric_type}/all")).with_scope(meta.scope.clone());
            self.combine_into(rollup, stats);
        }
    }

    pub fn combine(&mut self, other: &MetricSet) {
        for (meta, stats) in &other.metrics {
            self.combine_into(meta.clone(), stats);
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &MetricMap {
        &self.metrics
    }

    #[must_use]
    pub fn get(&self, meta: &MetricMeta) -> Option<&MetricStats> {
        self.metrics.get(meta)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    #[must_use]
    pub fn into_metrics(self) -> MetricMap {
        self.metrics
    }

    fn combine_into(&mut self, meta: MetricMeta, stats: &MetricStats) {
        self.metrics
            .entry(meta)
            .and_modify(|existing| existing.combine(stats))
            .or_insert_with(|| stats.clone());
    }
}
