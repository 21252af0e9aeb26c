// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The call tree of one unit of work.
//!
//! Instrumentation opens and closes layers on the current [`TrackedRequest`];
//! when the outermost layer closes, the finished tree is converted once and
//! handed to the store. A request is owned by a single thread or task, so
//! nothing in here is synchronized.

use crate::agent::AgentContext;
use crate::call_set::CallSet;
use crate::context::Context;
use crate::converters::{self, LayerFinder, RequestView};
use crate::layer::{Annotations, Layer, LayerName};
use crate::records::job_metric_name;
use derive_more::Display;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde_json::Value;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn};

/// Layer types whose frames are framework internals; never worth a backtrace.
pub const BACKTRACE_BLACKLIST: [&str; 2] = ["Controller", "Job"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum RequestType {
    #[default]
    #[display("unknown")]
    Unknown,
    #[display("web")]
    Web,
    #[display("job")]
    Job,
}

impl RequestType {
    #[must_use]
    pub fn is_web(self) -> bool {
        self == RequestType::Web
    }

    #[must_use]
    pub fn is_job(self) -> bool {
        self == RequestType::Job
    }
}

/// Result of opening a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerHandle {
    /// The layer is open at this stack depth, starting at 1.
    Active { depth: usize },
    /// Nothing was opened: children are ignored, or the request is ignored or
    /// already finished.
    Ignored,
}

#[derive(Debug)]
struct OpenLayer {
    layer: Layer,
    /// Repeated-call tracking for this layer's children, keyed by child name
    call_sets: HashMap<String, CallSet, FnvBuildHasher>,
}

#[derive(Debug)]
pub struct TrackedRequest {
    agent: Arc<AgentContext>,
    stack: Vec<OpenLayer>,
    root_layer: Option<Layer>,
    annotations: Annotations,
    headers: Option<HashMap<String, String>>,
    context: Context,
    error: bool,
    request_type: RequestType,
    ignoring_children: usize,
    ignoring_request: bool,
    ignored_depth: usize,
    stopping: bool,
    recorded: bool,
}

impl TrackedRequest {
    #[must_use]
    pub fn new(agent: Arc<AgentContext>) -> Self {
        Self {
            agent,
            stack: Vec::new(),
            root_layer: None,
            annotations: Annotations::new(),
            headers: None,
            context: Context::new(),
            error: false,
            request_type: RequestType::Unknown,
            ignoring_children: 0,
            ignoring_request: false,
            ignored_depth: 0,
            stopping: false,
            recorded: false,
        }
    }

    /// A request whose tree is already complete but not yet recorded.
    #[cfg(test)]
    pub(crate) fn finished(
        agent: Arc<AgentContext>,
        request_type: RequestType,
        root: Layer,
    ) -> Self {
        let mut request = Self::new(agent);
        request.request_type = request_type;
        request.root_layer = Some(root);
        request.stopping = true;
        request
    }

    pub fn start_layer(&mut self, layer_type: &str, name: impl Into<LayerName>) -> LayerHandle {
        self.start_layer_at(layer_type, name, Instant::now())
    }

    pub fn start_layer_at(
        &mut self,
        layer_type: &str,
        name: impl Into<LayerName>,
        at: Instant,
    ) -> LayerHandle {
        if self.ignoring_request {
            self.ignored_depth += 1;
            return LayerHandle::Ignored;
        }
        if self.stopping || self.recorded {
            debug!("Request already finished, not starting {layer_type} layer");
            return LayerHandle::Ignored;
        }
        if self.ignoring_children > 0 {
            return LayerHandle::Ignored;
        }

        let mut layer = Layer::with_children_cutoff(
            layer_type,
            name,
            at,
            self.agent.config().children_unique_cutoff,
        );
        layer.record_allocations_start(self.agent.allocations());
        self.stack.push(OpenLayer {
            layer,
            call_sets: HashMap::default(),
        });
        LayerHandle::Active {
            depth: self.stack.len(),
        }
    }

    pub fn stop_layer(&mut self) {
        self.stop_layer_at(Instant::now());
    }

    /// Close the innermost open layer. Closing the outermost layer finishes
    /// and records the request.
    pub fn stop_layer_at(&mut self, at: Instant) {
        if self.finish_layer(at) {
            self.record();
        }
    }

    /// Close the innermost open layer without recording, for use while
    /// unwinding. A request finished this way is recorded by a later
    /// [`record`](Self::record).
    pub fn stop_layer_without_recording(&mut self) {
        self.finish_layer(Instant::now());
    }

    /// Pop and stamp the innermost layer; true when it was the outermost one.
    fn finish_layer(&mut self, at: Instant) -> bool {
        if self.ignoring_request {
            self.ignored_depth = self.ignored_depth.saturating_sub(1);
            if self.ignored_depth == 0 {
                self.stopping = true;
                self.recorded = true;
            }
            return false;
        }
        if self.stopping || self.recorded || self.ignoring_children > 0 {
            return false;
        }

        let Some(OpenLayer { mut layer, .. }) = self.stack.pop() else {
            warn!("Stopping a layer with no open layers, ignoring");
            return false;
        };
        layer.record_stop_time(at);
        layer.record_allocations_stop(self.agent.allocations());

        let Some(parent) = self.stack.last_mut() else {
            self.stopping = true;
            self.root_layer = Some(layer);
            return true;
        };

        let magic_number = self.agent.config().n_plus_one_magic_number;
        let call_set = parent
            .call_sets
            .entry(layer.legacy_metric_name())
            .or_insert_with(|| CallSet::new(magic_number));
        call_set.update(layer.desc());

        if wants_backtrace(
            &layer,
            self.request_type,
            self.agent.config().backtrace_threshold,
            call_set,
        ) {
            layer.store_backtrace(self.agent.capture_backtrace());
        }
        parent.layer.add_child(layer);
        false
    }

    /// Convert the finished tree and hand the results to the store.
    ///
    /// Runs at most once; ignored requests and requests without a finished
    /// tree record nothing.
    pub fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        if self.ignoring_request {
            return;
        }

        let request: &TrackedRequest = self;
        let Some(root) = request.root_layer.as_ref() else {
            debug!("No finished layers, nothing to record");
            return;
        };
        let view = RequestView::new(request, &request.agent, root);
        let unique_name = view.unique_name();
        let span = info_span!(
            "record_request",
            unique_name = unique_name.as_deref().unwrap_or("unknown")
        );
        let _entered = span.enter();
        debug!("Recording {} request", request.request_type);
        converters::convert(view);
    }

    /// Run `f` inside a new layer.
    ///
    /// The layer is closed on every exit path. An `Err` or a panic marks the
    /// request as errored; the result or panic is passed on unchanged.
    pub fn instrument<T, E>(
        &mut self,
        layer_type: &str,
        name: impl Into<LayerName>,
        f: impl FnOnce(&mut Self) -> Result<T, E>,
    ) -> Result<T, E> {
        self.start_layer(layer_type, name);
        let outcome = catch_unwind(AssertUnwindSafe(|| f(self)));
        match outcome {
            Ok(result) => {
                if result.is_err() {
                    self.set_error();
                }
                self.stop_layer();
                result
            }
            Err(payload) => {
                self.set_error();
                self.stop_layer();
                resume_unwind(payload)
            }
        }
    }

    /// Merge values into the request annotations, last write wins.
    pub fn annotate_request<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.annotations
            .extend(values.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Merge values into the innermost open layer; no-op when none is open.
    pub fn annotate_layer<I, K>(&mut self, values: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if let Some(open) = self.stack.last_mut() {
            open.layer
                .annotate(values.into_iter().map(|(k, v)| (k.into(), v)).collect());
        }
    }

    pub fn ignore_children(&mut self) {
        self.ignoring_children += 1;
    }

    pub fn acknowledge_children(&mut self) {
        self.ignoring_children = self.ignoring_children.saturating_sub(1);
    }

    #[must_use]
    pub fn is_ignoring_children(&self) -> bool {
        self.ignoring_children > 0
    }

    /// Run `f` with layer starts and stops suppressed, restoring the previous
    /// state even if `f` panics.
    pub fn with_children_ignored<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.ignore_children();
        let outcome = catch_unwind(AssertUnwindSafe(|| f(self)));
        self.acknowledge_children();
        outcome.unwrap_or_else(|payload| resume_unwind(payload))
    }

    /// Drop everything tracked so far. Later layer calls only track depth,
    /// and the request finishes without recording once they balance out.
    pub fn ignore_request(&mut self) {
        if self.ignoring_request {
            return;
        }
        self.ignoring_request = true;
        self.ignored_depth = self.stack.len();
        self.stack.clear();
        self.root_layer = None;
        self.annotations.clear();
        if self.ignored_depth == 0 {
            self.stopping = true;
            self.recorded = true;
        }
    }

    #[must_use]
    pub fn is_ignoring_request(&self) -> bool {
        self.ignoring_request
    }

    pub fn web(&mut self) {
        self.request_type = RequestType::Web;
    }

    pub fn job(&mut self) {
        self.request_type = RequestType::Job;
    }

    #[must_use]
    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn set_error(&mut self) {
        self.error = true;
    }

    #[must_use]
    pub fn has_error(&self) -> bool {
        self.error
    }

    /// Describe the innermost open layer, e.g. with its SQL.
    pub fn set_layer_desc(&mut self, desc: impl Into<String>) {
        if let Some(open) = self.stack.last_mut() {
            open.layer.set_desc(desc);
        }
    }

    /// Attribute the descendants of the innermost open layer to it.
    pub fn mark_subscopable(&mut self) {
        if let Some(open) = self.stack.last_mut() {
            open.layer.make_subscopable();
        }
    }

    pub fn set_headers<I, K, V>(&mut self, headers: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.headers = Some(
            headers
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
    }

    #[must_use]
    pub fn headers(&self) -> Option<&HashMap<String, String>> {
        self.headers.as_ref()
    }

    #[must_use]
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Rename the outermost open Controller or Job layer, for frameworks that
    /// only learn the endpoint name after routing.
    pub fn rename_request_layer(&mut self, name: impl Into<LayerName>) -> bool {
        match self
            .stack
            .iter_mut()
            .find(|open| BACKTRACE_BLACKLIST.contains(&open.layer.layer_type().as_str()))
        {
            Some(open) => {
                open.layer.set_name(name);
                true
            }
            None => false,
        }
    }

    /// Name of the transaction this request belongs to, when it has one.
    #[must_use]
    pub fn unique_name(&self) -> Option<String> {
        if let Some(root) = &self.root_layer {
            return converters::unique_name(self.request_type, &LayerFinder::new(root));
        }
        let open = |layer_type: &str| {
            self.stack
                .iter()
                .map(|open| &open.layer)
                .find(|layer| layer.layer_type().as_str() == layer_type)
        };
        match self.request_type {
            RequestType::Web => open("Controller")
                .or_else(|| open("Job"))
                .map(Layer::legacy_metric_name),
            RequestType::Job => match (open("Queue"), open("Job")) {
                (Some(queue), Some(job)) => Some(job_metric_name(
                    &queue.name().as_str(),
                    &job.name().as_str(),
                )),
                _ => None,
            },
            RequestType::Unknown => None,
        }
    }

    #[must_use]
    pub fn root_layer(&self) -> Option<&Layer> {
        self.root_layer.as_ref()
    }

    #[must_use]
    pub fn current_layer(&self) -> Option<&Layer> {
        self.stack.last().map(|open| &open.layer)
    }

    /// Number of open layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.stack.len()
    }

    /// Whether the outermost layer has closed.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.recorded
    }

    #[must_use]
    pub fn agent(&self) -> &Arc<AgentContext> {
        &self.agent
    }
}

fn wants_backtrace(
    layer: &Layer,
    request_type: RequestType,
    threshold: Duration,
    call_set: &mut CallSet,
) -> bool {
    if layer.backtrace().is_some()
        || BACKTRACE_BLACKLIST.contains(&layer.layer_type().as_str())
        || !(request_type.is_web() || request_type.is_job())
    {
        return false;
    }
    layer.total_exclusive_time() > threshold || call_set.capture_backtrace()
}
