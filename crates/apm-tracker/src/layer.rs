// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Nodes of a request's call tree.
//!
//! A [`Layer`] is one traced operation. Layers are mutated only while they are
//! open on a request's stack; once popped they are handed to their parent's
//! [`LayerChildrenSet`] and never change again. Overflowing same-type children
//! are folded into a [`MergedLayer`], and both kinds are read through the
//! [`LayerNode`] view.

use crate::layer_children_set::{Children, LayerChildrenSet};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use ustr::{ustr, Ustr};

/// Free-form, layer- or request-specific values.
pub type Annotations = Map<String, Value>;

/// Annotation marking a layer that must not produce metrics.
pub const IGNORABLE_ANNOTATION: &str = "ignorable";

/// Maximum number of raw frames kept for a captured backtrace.
pub const BACKTRACE_CALLER_LIMIT: usize = 50;

/// Layer identifier, either owned text or a composite rendered on demand.
#[derive(Clone)]
pub enum LayerName {
    Text(String),
    Deferred(Arc<dyn Fn() -> String + Send + Sync>),
}

impl LayerName {
    pub fn deferred(render: impl Fn() -> String + Send + Sync + 'static) -> Self {
        LayerName::Deferred(Arc::new(render))
    }

    #[must_use]
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            LayerName::Text(text) => Cow::Borrowed(text),
            LayerName::Deferred(render) => Cow::Owned(render()),
        }
    }
}

impl fmt::Display for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl fmt::Debug for LayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayerName::Text(text) => write!(f, "{text:?}"),
            LayerName::Deferred(_) => write!(f, "Deferred({:?})", self.as_str()),
        }
    }
}

impl From<&str> for LayerName {
    fn from(value: &str) -> Self {
        LayerName::Text(value.to_owned())
    }
}

impl From<String> for LayerName {
    fn from(value: String) -> Self {
        LayerName::Text(value)
    }
}

#[derive(Debug)]
pub struct Layer {
    layer_type: Ustr,
    name: LayerName,
    start_time: Instant,
    stop_time: Option<Instant>,
    wall_start: SystemTime,
    children: LayerChildrenSet,
    desc: Option<String>,
    backtrace: Option<Vec<String>>,
    annotations: Annotations,
    subscopable: bool,
    allocations_start: u64,
    allocations_stop: Option<u64>,
}

impl Layer {
    pub fn new(layer_type: &str, name: impl Into<LayerName>, start_time: Instant) -> Self {
        Self::with_children_cutoff(
            layer_type,
            name,
            start_time,
            crate::layer_children_set::DEFAULT_UNIQUE_CUTOFF,
        )
    }

    pub fn with_children_cutoff(
        layer_type: &str,
        name: impl Into<LayerName>,
        start_time: Instant,
        unique_cutoff: usize,
    ) -> Self {
        let elapsed = Instant::now().saturating_duration_since(start_time);
        let wall_start = SystemTime::now()
            .checked_sub(elapsed)
            .unwrap_or_else(SystemTime::now);
        Self {
            layer_type: ustr(layer_type),
            name: name.into(),
            start_time,
            stop_time: None,
            wall_start,
            children: LayerChildrenSet::new(unique_cutoff),
            desc: None,
            backtrace: None,
            annotations: Annotations::new(),
            subscopable: false,
            allocations_start: 0,
            allocations_stop: None,
        }
    }

    #[must_use]
    pub fn layer_type(&self) -> Ustr {
        self.layer_type
    }

    #[must_use]
    pub fn name(&self) -> &LayerName {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<LayerName>) {
        self.name = name.into();
    }

    /// `"{type}/{name}"`, the unscoped metric name of this layer.
    #[must_use]
    pub fn legacy_metric_name(&self) -> String {
        format!("{}/{}", self.layer_type, self.name)
    }

    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    #[must_use]
    pub fn stop_time(&self) -> Option<Instant> {
        self.stop_time
    }

    #[must_use]
    pub fn wall_start(&self) -> SystemTime {
        self.wall_start
    }

    /// Stamp the stop time. A layer is stopped at most once.
    pub fn record_stop_time(&mut self, at: Instant) {
        if self.stop_time.is_none() {
            self.stop_time = Some(at.max(self.start_time));
        }
    }

    pub fn record_allocations_start(&mut self, allocations: u64) {
        self.allocations_start = allocations;
    }

    pub fn record_allocations_stop(&mut self, allocations: u64) {
        if self.allocations_stop.is_none() {
            self.allocations_stop = Some(allocations);
        }
    }

    #[must_use]
    pub fn children(&self) -> &LayerChildrenSet {
        &self.children
    }

    pub(crate) fn add_child(&mut self, child: Layer) {
        self.children.add(child);
    }

    /// Move the individual children out, leaving the totals untouched.
    pub(crate) fn detach_children(&mut self) -> Vec<Layer> {
        self.children.detach_layers()
    }

    #[must_use]
    pub fn desc(&self) -> Option<&str> {
        self.desc.as_deref()
    }

    pub fn set_desc(&mut self, desc: impl Into<String>) {
        self.desc = Some(desc.into());
    }

    #[must_use]
    pub fn backtrace(&self) -> Option<&[String]> {
        self.backtrace.as_deref()
    }

    /// Keep the first captured backtrace; later captures are dropped.
    pub fn store_backtrace(&mut self, mut frames: Vec<String>) {
        if self.backtrace.is_none() {
            frames.truncate(BACKTRACE_CALLER_LIMIT);
            self.backtrace = Some(frames);
        }
    }

    #[must_use]
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Merge keys into the annotations, last write wins.
    pub fn annotate(&mut self, values: Annotations) {
        self.annotations.extend(values);
    }

    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        is_truthy(self.annotations.get(IGNORABLE_ANNOTATION))
    }

    #[must_use]
    pub fn subscopable(&self) -> bool {
        self.subscopable
    }

    pub fn make_subscopable(&mut self) {
        self.subscopable = true;
    }

    /// Inclusive time; zero while the layer is open.
    #[must_use]
    pub fn total_call_time(&self) -> Duration {
        self.stop_time
            .map_or(Duration::ZERO, |stop| stop.duration_since(self.start_time))
    }

    #[must_use]
    pub fn total_exclusive_time(&self) -> Duration {
        self.total_call_time()
            .saturating_sub(self.children.total_call_time())
    }

    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.allocations_stop
            .map_or(0, |stop| stop.saturating_sub(self.allocations_start))
    }

    #[must_use]
    pub fn total_exclusive_allocations(&self) -> u64 {
        self.total_allocations()
            .saturating_sub(self.children.total_allocations())
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(_) => true,
    }
}

/// Summed stand-in for same-type children past the per-parent cutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedLayer {
    layer_type: Ustr,
    count: u64,
    total_call_time: Duration,
    total_exclusive_time: Duration,
    total_allocations: u64,
    total_exclusive_allocations: u64,
}

impl MergedLayer {
    #[must_use]
    pub fn new(layer_type: Ustr) -> Self {
        Self {
            layer_type,
            count: 0,
            total_call_time: Duration::ZERO,
            total_exclusive_time: Duration::ZERO,
            total_allocations: 0,
            total_exclusive_allocations: 0,
        }
    }

    pub fn absorb(&mut self, layer: &Layer) {
        self.count += 1;
        self.total_call_time += layer.total_call_time();
        self.total_exclusive_time += layer.total_exclusive_time();
        self.total_allocations += layer.total_allocations();
        self.total_exclusive_allocations += layer.total_exclusive_allocations();
    }

    #[must_use]
    pub fn layer_type(&self) -> Ustr {
        self.layer_type
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn legacy_metric_name(&self) -> String {
        format!("{}/Merged", self.layer_type)
    }

    #[must_use]
    pub fn total_call_time(&self) -> Duration {
        self.total_call_time
    }

    #[must_use]
    pub fn total_exclusive_time(&self) -> Duration {
        self.total_exclusive_time
    }

    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }

    #[must_use]
    pub fn total_exclusive_allocations(&self) -> u64 {
        self.total_exclusive_allocations
    }
}

/// Read-only view over either kind of tree node.
#[derive(Debug, Clone, Copy)]
pub enum LayerNode<'a> {
    Detailed(&'a Layer),
    Merged(&'a MergedLayer),
}

impl<'a> LayerNode<'a> {
    #[must_use]
    pub fn layer_type(&self) -> Ustr {
        match self {
            LayerNode::Detailed(layer) => layer.layer_type(),
            LayerNode::Merged(merged) => merged.layer_type(),
        }
    }

    /// Display name; merged nodes are named `Merged`.
    #[must_use]
    pub fn name(&self) -> Cow<'a, str> {
        match self {
            LayerNode::Detailed(layer) => layer.name().as_str(),
            LayerNode::Merged(_) => Cow::Borrowed("Merged"),
        }
    }

    #[must_use]
    pub fn legacy_metric_name(&self) -> String {
        match self {
            LayerNode::Detailed(layer) => layer.legacy_metric_name(),
            LayerNode::Merged(merged) => merged.legacy_metric_name(),
        }
    }

    #[must_use]
    pub fn total_call_time(&self) -> Duration {
        match self {
            LayerNode::Detailed(layer) => layer.total_call_time(),
            LayerNode::Merged(merged) => merged.total_call_time(),
        }
    }

    #[must_use]
    pub fn total_exclusive_time(&self) -> Duration {
        match self {
            LayerNode::Detailed(layer) => layer.total_exclusive_time(),
            LayerNode::Merged(merged) => merged.total_exclusive_time(),
        }
    }

    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        match self {
            LayerNode::Detailed(layer) => layer.total_allocations(),
            LayerNode::Merged(merged) => merged.total_allocations(),
        }
    }

    #[must_use]
    pub fn total_exclusive_allocations(&self) -> u64 {
        match self {
            LayerNode::Detailed(layer) => layer.total_exclusive_allocations(),
            LayerNode::Merged(merged) => merged.total_exclusive_allocations(),
        }
    }

    /// Number of operations this node stands for.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        match self {
            LayerNode::Detailed(_) => 1,
            LayerNode::Merged(merged) => merged.count(),
        }
    }

    #[must_use]
    pub fn children(&self) -> Children<'a> {
        match self {
            LayerNode::Detailed(layer) => layer.children().iter(),
            LayerNode::Merged(_) => Children::empty(),
        }
    }

    #[must_use]
    pub fn desc(&self) -> Option<&'a str> {
        match self {
            LayerNode::Detailed(layer) => layer.desc(),
            LayerNode::Merged(_) => None,
        }
    }

    #[must_use]
    pub fn backtrace(&self) -> Option<&'a [String]> {
        match self {
            LayerNode::Detailed(layer) => layer.backtrace(),
            LayerNode::Merged(_) => None,
        }
    }

    #[must_use]
    pub fn annotations(&self) -> Option<&'a Annotations> {
        match self {
            LayerNode::Detailed(layer) => Some(layer.annotations()),
            LayerNode::Merged(_) => None,
        }
    }

    #[must_use]
    pub fn is_ignorable(&self) -> bool {
        matches!(self, LayerNode::Detailed(layer) if layer.is_ignorable())
    }

    #[must_use]
    pub fn subscopable(&self) -> bool {
        matches!(self, LayerNode::Detailed(layer) if layer.subscopable())
    }

    #[must_use]
    pub fn as_layer(&self) -> Option<&'a Layer> {
        match self {
            LayerNode::Detailed(layer) => Some(layer),
            LayerNode::Merged(_) => None,
        }
    }

    /// Identity comparison: both views point at the same node.
    #[must_use]
    pub fn is_same(&self, other: &LayerNode<'_>) -> bool {
        match (self, other) {
            (LayerNode::Detailed(a), LayerNode::Detailed(b)) => std::ptr::eq(*a, *b),
            (LayerNode::Merged(a), LayerNode::Merged(b)) => std::ptr::eq(*a, *b),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_layer(&self, other: &Layer) -> bool {
        matches!(self, LayerNode::Detailed(layer) if std::ptr::eq(*layer, other))
    }
}
