// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of a finished request tree into metrics and traces.
//!
//! All converters share one depth-first walk. Each one is isolated: an error
//! or panic in one converter is logged and drops only that converter's
//! output for the request.

mod allocation;
mod database;
mod detail;
mod error;
mod histograms;
mod job;
mod metric;
mod queue_time;
mod slow_job;
mod slow_request;
pub mod walker;

pub use allocation::AllocationMetricConverter;
pub use database::DatabaseConverter;
pub use error::ErrorConverter;
pub use histograms::HistogramsConverter;
pub use job::JobConverter;
pub use metric::MetricConverter;
pub use queue_time::RequestQueueTimeConverter;
pub use slow_job::SlowJobConverter;
pub use slow_request::SlowRequestConverter;
pub use walker::{walk, LayerVisitor};

use crate::agent::AgentContext;
use crate::errors::ConvertError;
use crate::layer::{Layer, LayerNode};
use crate::records::job_metric_name;
use crate::tracked_request::{RequestType, TrackedRequest};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

pub trait LayerConverter<'a> {
    fn name(&self) -> &'static str;

    fn before(&mut self, _layer: LayerNode<'a>) {}

    fn visit(&mut self, _layer: LayerNode<'a>) -> Result<(), ConvertError> {
        Ok(())
    }

    fn after(&mut self, _layer: LayerNode<'a>) {}

    /// Hand the converter's output to the store.
    fn record(self: Box<Self>) -> Result<(), ConvertError>;
}

/// First Controller, Job and Queue layers of a tree, in pre-order.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerFinder<'a> {
    controller: Option<&'a Layer>,
    job: Option<&'a Layer>,
    queue: Option<&'a Layer>,
}

impl<'a> LayerFinder<'a> {
    #[must_use]
    pub fn new(root: &'a Layer) -> Self {
        let mut finder = LayerFinder::default();
        walk(root, &mut finder);
        finder
    }

    /// Attribution anchor: the first Controller, else the first Job.
    #[must_use]
    pub fn scope_layer(&self) -> Option<&'a Layer> {
        self.controller.or(self.job)
    }

    #[must_use]
    pub fn job_layer(&self) -> Option<&'a Layer> {
        self.job
    }

    #[must_use]
    pub fn queue_layer(&self) -> Option<&'a Layer> {
        self.queue
    }
}

impl<'a> LayerVisitor<'a> for LayerFinder<'a> {
    fn visit(&mut self, layer: LayerNode<'a>) {
        let Some(layer) = layer.as_layer() else {
            return;
        };
        let slot = match layer.layer_type().as_str() {
            "Controller" => &mut self.controller,
            "Job" => &mut self.job,
            "Queue" => &mut self.queue,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(layer);
        }
    }
}

/// Name of the transaction a request belongs to.
///
/// Web requests are named after their scope layer, jobs after their queue
/// and job layers; anything else has no name.
pub(crate) fn unique_name(request_type: RequestType, layers: &LayerFinder<'_>) -> Option<String> {
    match request_type {
        RequestType::Web => layers.scope_layer().map(Layer::legacy_metric_name),
        RequestType::Job => match (layers.queue_layer(), layers.job_layer()) {
            (Some(queue), Some(job)) => Some(job_metric_name(
                &queue.name().as_str(),
                &job.name().as_str(),
            )),
            _ => None,
        },
        RequestType::Unknown => None,
    }
}

/// What every converter sees of the finished request.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub request: &'a TrackedRequest,
    pub agent: &'a AgentContext,
    pub root: &'a Layer,
    pub layers: LayerFinder<'a>,
}

impl<'a> RequestView<'a> {
    #[must_use]
    pub fn new(request: &'a TrackedRequest, agent: &'a AgentContext, root: &'a Layer) -> Self {
        Self {
            request,
            agent,
            root,
            layers: LayerFinder::new(root),
        }
    }

    #[must_use]
    pub fn scope_layer(&self) -> Option<&'a Layer> {
        self.layers.scope_layer()
    }

    #[must_use]
    pub fn unique_name(&self) -> Option<String> {
        unique_name(self.request.request_type(), &self.layers)
    }
}

/// Construct one converter, isolated like the rest of its work.
fn build<'a, C>(
    name: &'static str,
    view: RequestView<'a>,
    new: impl FnOnce(RequestView<'a>) -> C,
) -> Option<Box<dyn LayerConverter<'a> + 'a>>
where
    C: LayerConverter<'a> + 'a,
{
    match catch_unwind(AssertUnwindSafe(|| new(view))) {
        Ok(converter) => Some(Box::new(converter)),
        Err(payload) => {
            let e = ConvertError::Panicked(panic_message(&payload));
            warn!("Converter {name} failed, dropping its output for this request: {e}");
            None
        }
    }
}

/// Every converter run for a finished request, in recording order.
fn build_converters<'a>(view: RequestView<'a>) -> Vec<Box<dyn LayerConverter<'a> + 'a>> {
    [
        build("histograms", view, HistogramsConverter::new),
        build("metric", view, MetricConverter::new),
        build("error", view, ErrorConverter::new),
        build("allocation", view, AllocationMetricConverter::new),
        build("queue_time", view, RequestQueueTimeConverter::new),
        build("job", view, JobConverter::new),
        build("slow_job", view, SlowJobConverter::new),
        build("slow_request", view, SlowRequestConverter::new),
        build("database", view, DatabaseConverter::new),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Walk the tree once with every converter, then record each one.
pub fn convert(view: RequestView<'_>) {
    let mut runner = ConverterRunner::new(build_converters(view));
    walk(view.root, &mut runner);
    runner.record_all();
}

pub(crate) struct ConverterRunner<'a> {
    slots: Vec<Option<Box<dyn LayerConverter<'a> + 'a>>>,
}

impl<'a> ConverterRunner<'a> {
    pub(crate) fn new(converters: Vec<Box<dyn LayerConverter<'a> + 'a>>) -> Self {
        Self {
            slots: converters.into_iter().map(Some).collect(),
        }
    }

    fn each(
        &mut self,
        mut f: impl FnMut(&mut (dyn LayerConverter<'a> + 'a)) -> Result<(), ConvertError>,
    ) {
        for slot in &mut self.slots {
            let Some(converter) = slot.as_mut() else {
                continue;
            };
            let name = converter.name();
            let outcome = catch_unwind(AssertUnwindSafe(|| f(converter.as_mut())))
                .unwrap_or_else(|payload| Err(ConvertError::Panicked(panic_message(&payload))));

            if let Err(e) = outcome {
                warn!("Converter {name} failed, dropping its output for this request: {e}");
                *slot = None;
            }
        }
    }

    pub(crate) fn record_all(self) {
        for converter in self.slots.into_iter().flatten() {
            let name = converter.name();
            let outcome = catch_unwind(AssertUnwindSafe(move || converter.record()))
                .unwrap_or_else(|payload| Err(ConvertError::Panicked(panic_message(&payload))));

            if let Err(e) = outcome {
                warn!("Converter {name} failed to record: {e}");
            }
        }
    }
}

impl<'a> LayerVisitor<'a> for ConverterRunner<'a> {
    fn before(&mut self, layer: LayerNode<'a>) {
        self.each(|converter| {
            converter.before(layer);
            Ok(())
        });
    }

    fn visit(&mut self, layer: LayerNode<'a>) {
        self.each(|converter| converter.visit(layer));
    }

    fn after(&mut self, layer: LayerNode<'a>) {
        self.each(|converter| {
            converter.after(layer);
            Ok(())
        });
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|msg| (*msg).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}
