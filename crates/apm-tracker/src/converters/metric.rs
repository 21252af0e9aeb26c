// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::layer::{Layer, LayerNode};
use crate::metric::{MetricMap, MetricMeta, MetricStats};

/// Aggregate metrics of a request, attributed to its scope layer.
///
/// The scope layer is recorded unscoped under its full name. Every other
/// layer is recorded under its type only, scoped to the scope layer, plus an
/// unscoped `{type}/all` rollup. Requests without a scope layer produce
/// nothing.
pub struct MetricConverter<'a> {
    view: RequestView<'a>,
    scope: Option<(&'a Layer, String)>,
    metrics: MetricMap,
}

impl<'a> MetricConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        let scope = view
            .scope_layer()
            .map(|layer| (layer, layer.legacy_metric_name()));
        Self {
            view,
            scope,
            metrics: MetricMap::new(),
        }
    }
}

fn update(metrics: &mut MetricMap, meta: MetricMeta, node: LayerNode<'_>) {
    let count = node.call_count();
    let call_time = node.total_call_time().as_secs_f64();
    let exclusive_time = node.total_exclusive_time().as_secs_f64();
    let scoped = meta.is_scoped();
    let stats = metrics
        .entry(meta)
        .or_insert_with(|| MetricStats::new(scoped));
    if count == 1 {
        stats.update(call_time, exclusive_time);
    } else {
        stats.update_many(count, call_time, exclusive_time);
    }
}

impl<'a> LayerConverter<'a> for MetricConverter<'a> {
    fn name(&self) -> &'static str {
        "metric"
    }

    fn visit(&mut self, layer: LayerNode<'a>) -> Result<(), ConvertError> {
        let Some((scope_layer, scope_name)) = &self.scope else {
            return Ok(());
        };
        if layer.is_ignorable() {
            return Ok(());
        }

        if layer.is_layer(scope_layer) {
            update(&mut self.metrics, MetricMeta::new(scope_name.clone()), layer);
            return Ok(());
        }

        let layer_type = layer.layer_type();
        let meta = MetricMeta::scoped(layer_type.as_str(), scope_name.clone());
        update(&mut self.metrics, meta, layer);
        update(
            &mut self.metrics,
            MetricMeta::new(format!("{layer_type}/all")),
            layer,
        );
        Ok(())
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if !self.metrics.is_empty() {
            self.view.agent.store().track(self.metrics);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::layer::{Annotations, IGNORABLE_ANNOTATION};
    use crate::test_support::{agent_with, run, stopped};
    use crate::tracked_request::{RequestType, TrackedRequest};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn users_index(start: Instant) -> Layer {
        let mut root = Layer::new("Controller", "users#index", start);
        root.add_child(stopped("ActiveRecord", "User/find", start, 50));
        root.record_stop_time(start + Duration::from_millis(200));
        root
    }

    #[test]
    fn test_scope_layer_unscoped_children_by_type() {
        let (agent, store) = agent_with(AgentConfig::default());
        let request =
            TrackedRequest::finished(agent.clone(), RequestType::Web, users_index(Instant::now()));
        let root = request.root_layer().unwrap();
        let view = RequestView::new(&request, &agent, root);
        run(view, Box::new(MetricConverter::new(view)));

        let metrics = store.merged_metrics();
        let controller = &metrics[&MetricMeta::new("Controller/users#index")];
        assert_eq!(controller.total_call_time, 0.2);
        assert!((controller.total_exclusive_time - 0.15).abs() < 1e-9);

        let scoped = &metrics[&MetricMeta::scoped("ActiveRecord", "Controller/users#index")];
        assert_eq!(scoped.call_count, 1);
        assert_eq!(
            metrics[&MetricMeta::new("ActiveRecord/all")].total_call_time,
            0.05
        );
        assert_eq!(metrics.len(), 3);
    }

    #[test]
    fn test_ignorable_layers_produce_nothing() {
        let (agent, store) = agent_with(AgentConfig::default());
        let start = Instant::now();
        let mut root = Layer::new("Controller", "users#index", start);
        let mut cached = stopped("ActiveRecord", "User/find", start, 5);
        let mut values = Annotations::new();
        values.insert(IGNORABLE_ANNOTATION.to_string(), json!(true));
        cached.annotate(values);
        root.add_child(cached);
        root.record_stop_time(start + Duration::from_millis(10));

        let request = TrackedRequest::finished(agent.clone(), RequestType::Web, root);
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(MetricConverter::new(view)));

        let metrics = store.merged_metrics();
        assert_eq!(metrics.len(), 1);
        assert!(metrics.contains_key(&MetricMeta::new("Controller/users#index")));
    }

    #[test]
    fn test_no_scope_layer_tracks_nothing() {
        let (agent, store) = agent_with(AgentConfig::default());
        let start = Instant::now();
        let mut root = Layer::new("Middleware", "Rack", start);
        root.add_child(stopped("ActiveRecord", "User/find", start, 5));
        root.record_stop_time(start + Duration::from_millis(10));

        let request = TrackedRequest::finished(agent.clone(), RequestType::Web, root);
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(MetricConverter::new(view)));

        assert_eq!(store.track_count(), 0);
    }

    #[test]
    fn test_layers_above_scope_are_scoped_to_it() {
        let (agent, store) = agent_with(AgentConfig::default());
        let start = Instant::now();
        let mut root = Layer::new("Middleware", "Rack", start);
        root.add_child(users_index(start));
        root.record_stop_time(start + Duration::from_millis(300));

        let request = TrackedRequest::finished(agent.clone(), RequestType::Web, root);
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(MetricConverter::new(view)));

        let metrics = store.merged_metrics();
        assert_eq!(
            metrics[&MetricMeta::scoped("Middleware", "Controller/users#index")].total_call_time,
            0.3
        );
        assert!(metrics.contains_key(&MetricMeta::new("Middleware/all")));
    }
}
