// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::metric::{MetricKind, MetricMap, MetricMeta, MetricStats};

/// `ObjectAllocations` of the whole request, scoped to its scope layer.
///
/// Only produced when allocation tracking is enabled.
pub struct AllocationMetricConverter<'a> {
    view: RequestView<'a>,
}

impl<'a> AllocationMetricConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        Self { view }
    }
}

impl<'a> LayerConverter<'a> for AllocationMetricConverter<'a> {
    fn name(&self) -> &'static str {
        "allocation"
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if !self.view.agent.config().track_allocations {
            return Ok(());
        }
        let Some(scope_layer) = self.view.scope_layer() else {
            return Ok(());
        };

        let allocations = self.view.root.total_allocations() as f64;
        let mut stats = MetricStats::new(true);
        stats.update(allocations, allocations);

        let meta = MetricMeta::scoped("ObjectAllocations", scope_layer.legacy_metric_name())
            .with_kind(MetricKind::Allocations);
        let mut metrics = MetricMap::new();
        metrics.insert(meta, stats);
        self.view.agent.store().track(metrics);
        Ok(())
    }
}
