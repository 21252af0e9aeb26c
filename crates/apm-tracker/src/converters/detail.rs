// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-layer detail metrics shared by the slow request and slow job traces.

use crate::agent::AgentContext;
use crate::layer::{Layer, LayerNode};
use crate::metric::{MetricKind, MetricMap, MetricMeta, MetricStats};

/// Longest description kept on a detail metric, in characters.
pub const MAX_DESC_LENGTH: usize = 32_768;

/// Builds the exact-name and `{type}/all` metrics of one trace.
///
/// Layers are attributed to the nearest enclosing subscopable layer, else to
/// the anchor. The anchor itself is never scoped under itself.
pub(crate) struct DetailMetrics<'a> {
    agent: &'a AgentContext,
    anchor: Option<&'a Layer>,
    anchor_name: Option<String>,
    subscopes: Vec<(LayerNode<'a>, String)>,
    metrics: MetricMap,
    allocation_metrics: MetricMap,
    limit: usize,
    limited: bool,
}

impl<'a> DetailMetrics<'a> {
    pub(crate) fn new(agent: &'a AgentContext, anchor: Option<&'a Layer>) -> Self {
        Self {
            agent,
            anchor,
            anchor_name: anchor.map(Layer::legacy_metric_name),
            subscopes: Vec::new(),
            metrics: MetricMap::new(),
            allocation_metrics: MetricMap::new(),
            limit: agent.config().max_metrics_per_trace,
            limited: false,
        }
    }

    pub(crate) fn enter(&mut self, layer: LayerNode<'a>) {
        if layer.subscopable() {
            self.subscopes.push((layer, layer.legacy_metric_name()));
        }
    }

    pub(crate) fn leave(&mut self, layer: LayerNode<'a>) {
        if matches!(self.subscopes.last(), Some((top, _)) if top.is_same(&layer)) {
            self.subscopes.pop();
        }
    }

    fn scope_for(&self, layer: LayerNode<'a>) -> Option<String> {
        if let Some((_, name)) = self
            .subscopes
            .iter()
            .rev()
            .find(|(subscope, _)| !subscope.is_same(&layer))
        {
            return Some(name.clone());
        }
        match self.anchor {
            Some(anchor) if !layer.is_layer(anchor) => self.anchor_name.clone(),
            _ => None,
        }
    }

    pub(crate) fn record(&mut self, layer: LayerNode<'a>) {
        if layer.is_ignorable() {
            return;
        }
        if self.metrics.len() >= self.limit {
            self.limited = true;
            return;
        }

        let scope = self.scope_for(layer);
        let scoped = scope.is_some();
        let count = layer.call_count();
        let call_time = layer.total_call_time().as_secs_f64();
        let exclusive_time = layer.total_exclusive_time().as_secs_f64();
        let allocations = layer.total_allocations() as f64;
        let exclusive_allocations = layer.total_exclusive_allocations() as f64;

        let mut meta = MetricMeta::new(layer.legacy_metric_name())
            .with_scope(scope)
            .with_desc(layer.desc().map(truncate_desc));
        let allocation_meta = meta.clone().with_kind(MetricKind::Allocations);
        meta.backtrace = layer
            .backtrace()
            .map(|frames| self.agent.clean_backtrace(frames));
        if let Some(annotations) = layer.annotations() {
            meta.extra.clone_from(annotations);
        }

        record_into(
            &mut self.metrics,
            meta,
            scoped,
            count,
            call_time,
            exclusive_time,
        );
        record_into(
            &mut self.allocation_metrics,
            allocation_meta,
            scoped,
            count,
            allocations,
            exclusive_allocations,
        );

        let rollup = MetricMeta::new(format!("{}/all", layer.layer_type()));
        let allocation_rollup = rollup.clone().with_kind(MetricKind::Allocations);
        record_into(
            &mut self.metrics,
            rollup,
            false,
            count,
            call_time,
            exclusive_time,
        );
        record_into(
            &mut self.allocation_metrics,
            allocation_rollup,
            false,
            count,
            allocations,
            exclusive_allocations,
        );
    }

    /// Whether layers were skipped because the trace hit its metric limit.
    pub(crate) fn is_limited(&self) -> bool {
        self.limited
    }

    pub(crate) fn into_parts(self) -> (MetricMap, MetricMap, bool) {
        (self.metrics, self.allocation_metrics, self.limited)
    }
}

fn truncate_desc(desc: &str) -> String {
    match desc.char_indices().nth(MAX_DESC_LENGTH) {
        Some((end, _)) => desc[..end].to_owned(),
        None => desc.to_owned(),
    }
}

/// Fold one node into `metrics`. The first backtrace seen for a key is kept;
/// annotations merge, last write wins.
fn record_into(
    metrics: &mut MetricMap,
    mut meta: MetricMeta,
    scoped: bool,
    count: u64,
    call_time: f64,
    exclusive_time: f64,
) {
    let mut stats = match metrics.remove_entry(&meta) {
        Some((mut existing, stats)) => {
            if existing.backtrace.is_none() {
                existing.backtrace = meta.backtrace.take();
            }
            existing.extra.append(&mut meta.extra);
            meta = existing;
            stats
        }
        None => MetricStats::new(scoped),
    };

    if count == 1 {
        stats.update(call_time, exclusive_time);
    } else {
        stats.update_many(count, call_time, exclusive_time);
    }
    metrics.insert(meta, stats);
}
