// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::detail::DetailMetrics;
use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::layer::{Layer, LayerNode};
use crate::records::{job_metric_name, SlowJobRecord};
use std::time::SystemTime;
use tracing::debug;

/// Detailed trace of a job run that was slow compared to earlier runs.
pub struct SlowJobConverter<'a> {
    view: RequestView<'a>,
    target: Option<SlowJob<'a>>,
}

struct SlowJob<'a> {
    name: String,
    queue: &'a Layer,
    job: &'a Layer,
    detail: DetailMetrics<'a>,
}

impl<'a> SlowJobConverter<'a> {
    /// Decides right away whether the run is slow, which also records its
    /// time in the job's history.
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        let target = Self::slow_job(view);
        Self { view, target }
    }

    fn slow_job(view: RequestView<'a>) -> Option<SlowJob<'a>> {
        if !view.request.request_type().is_job() {
            return None;
        }
        let queue = view.layers.queue_layer()?;
        let job = view.layers.job_layer()?;
        let name = job_metric_name(&queue.name().as_str(), &job.name().as_str());

        let total = view.root.total_call_time();
        if !view.agent.slow_job_policy().slow(&name, total) {
            return None;
        }
        debug!("Job {name} took {total:?}, capturing a slow job trace");
        Some(SlowJob {
            name,
            queue,
            job,
            detail: DetailMetrics::new(view.agent, Some(job)),
        })
    }
}

impl<'a> LayerConverter<'a> for SlowJobConverter<'a> {
    fn name(&self) -> &'static str {
        "slow_job"
    }

    fn before(&mut self, layer: LayerNode<'a>) {
        if let Some(target) = &mut self.target {
            target.detail.enter(layer);
        }
    }

    fn visit(&mut self, layer: LayerNode<'a>) -> Result<(), ConvertError> {
        if let Some(target) = &mut self.target {
            if !layer.is_layer(target.queue) {
                target.detail.record(layer);
            }
        }
        Ok(())
    }

    fn after(&mut self, layer: LayerNode<'a>) {
        if let Some(target) = &mut self.target {
            target.detail.leave(layer);
        }
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        let agent = self.view.agent;
        let now = SystemTime::now();
        let total = self.view.root.total_call_time();

        let score = agent
            .slow_job_policy()
            .score(Some(&target.name), total, now);
        agent.slow_job_policy().stored(&target.name, now);

        let (metrics, allocation_metrics, truncated_metrics) = target.detail.into_parts();
        let record = SlowJobRecord {
            metric_name: target.name,
            queue_name: target.queue.name().to_string(),
            job_name: target.job.name().to_string(),
            time: now,
            total_time: target.job.total_call_time(),
            exclusive_time: target.job.total_exclusive_time(),
            context: self.view.request.context().clone(),
            metrics,
            allocation_metrics,
            allocations: self.view.root.total_allocations(),
            score,
            truncated_metrics,
        };
        agent.store().track_slow_job(record);
        Ok(())
    }
}
