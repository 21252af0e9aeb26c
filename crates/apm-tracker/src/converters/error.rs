// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::metric::{MetricMap, MetricMeta, MetricStats};

/// One `Errors/{scope}` count for a request that ended in error.
pub struct ErrorConverter<'a> {
    view: RequestView<'a>,
}

impl<'a> ErrorConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        Self { view }
    }
}

impl<'a> LayerConverter<'a> for ErrorConverter<'a> {
    fn name(&self) -> &'static str {
        "error"
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if !self.view.request.has_error() {
            return Ok(());
        }
        let Some(scope_layer) = self.view.scope_layer() else {
            return Ok(());
        };

        let mut stats = MetricStats::new(false);
        stats.update(1.0, 1.0);
        let mut metrics = MetricMap::new();
        metrics.insert(
            MetricMeta::new(format!("Errors/{}", scope_layer.legacy_metric_name())),
            stats,
        );
        self.view.agent.store().track(metrics);
        Ok(())
    }
}
