// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::layer::{Layer, LayerNode};
use crate::metric::{MetricMap, MetricMeta, MetricStats};
use crate::records::JobRecord;
use serde_json::Value;

/// Request annotation holding how long the job waited in its queue, in seconds.
pub const QUEUE_LATENCY_ANNOTATION: &str = "queue_latency";

/// Aggregate record of one background job run.
///
/// Every layer below the job is recorded under its type, scoped to the job,
/// together with the queue latency.
pub struct JobConverter<'a> {
    view: RequestView<'a>,
    layers: Option<JobLayers<'a>>,
    metrics: MetricMap,
}

struct JobLayers<'a> {
    queue: &'a Layer,
    job: &'a Layer,
    scope: String,
}

impl<'a> JobLayers<'a> {
    fn find(view: &RequestView<'a>) -> Result<Self, ConvertError> {
        let queue = view
            .layers
            .queue_layer()
            .ok_or(ConvertError::MissingLayer("Queue"))?;
        let job = view
            .layers
            .job_layer()
            .ok_or(ConvertError::MissingLayer("Job"))?;
        Ok(Self {
            queue,
            job,
            scope: job.legacy_metric_name(),
        })
    }
}

impl<'a> JobConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        Self {
            view,
            layers: None,
            metrics: MetricMap::new(),
        }
    }

    fn is_job(&self) -> bool {
        self.view.request.request_type().is_job()
    }
}

/// Seconds from the `queue_latency` annotation; absent means no wait.
fn queue_latency(value: Option<&Value>) -> Result<f64, ConvertError> {
    let malformed = |reason: String| ConvertError::MalformedAnnotation {
        key: QUEUE_LATENCY_ANNOTATION.to_string(),
        reason,
    };
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(number)) => number
            .as_f64()
            .ok_or_else(|| malformed(format!("{number} is not a valid duration"))),
        Some(other) => Err(malformed(format!("expected a number, got {other}"))),
    }
}

impl<'a> LayerConverter<'a> for JobConverter<'a> {
    fn name(&self) -> &'static str {
        "job"
    }

    fn visit(&mut self, layer: LayerNode<'a>) -> Result<(), ConvertError> {
        if !self.is_job() {
            return Ok(());
        }
        if self.layers.is_none() {
            self.layers = Some(JobLayers::find(&self.view)?);
        }
        let Some(layers) = &self.layers else {
            return Ok(());
        };

        if layer.is_layer(layers.job) || layer.is_layer(layers.queue) || layer.is_ignorable() {
            return Ok(());
        }

        let stats = self
            .metrics
            .entry(MetricMeta::scoped(
                layer.layer_type().as_str(),
                layers.scope.clone(),
            ))
            .or_insert_with(|| MetricStats::new(true));
        let call_time = layer.total_call_time().as_secs_f64();
        let exclusive_time = layer.total_exclusive_time().as_secs_f64();
        match layer.call_count() {
            1 => stats.update(call_time, exclusive_time),
            count => stats.update_many(count, call_time, exclusive_time),
        }
        Ok(())
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if !self.is_job() {
            return Ok(());
        }
        let layers = match self.layers {
            Some(layers) => layers,
            None => JobLayers::find(&self.view)?,
        };

        let latency = queue_latency(
            self.view
                .request
                .annotations()
                .get(QUEUE_LATENCY_ANNOTATION),
        )?;
        let mut metrics = self.metrics;
        let mut latency_stats = MetricStats::new(true);
        latency_stats.update(latency, latency);
        metrics.insert(MetricMeta::scoped("Latency", layers.scope), latency_stats);

        let record = JobRecord::new(
            layers.queue.name().as_str(),
            layers.job.name().as_str(),
            layers.job.total_call_time(),
            layers.job.total_exclusive_time(),
            u64::from(self.view.request.has_error()),
            &metrics,
        );
        self.view.agent.store().track_job(record);
        Ok(())
    }
}
