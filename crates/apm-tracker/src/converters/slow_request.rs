// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::detail::DetailMetrics;
use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::layer::{Layer, LayerNode};
use crate::metric::{MetricMap, MetricMeta, MetricStats};
use crate::policy::CaptureType;
use crate::records::SlowTransaction;
use serde_json::Value;
use std::time::SystemTime;

/// Request annotation holding the request path.
pub const URI_ANNOTATION: &str = "uri";

/// Trace of a slow web request.
///
/// The capture type is decided by the slow request policy when the converter
/// is created. Detail metrics are only built for detailed captures; summary
/// captures keep the totals and context.
pub struct SlowRequestConverter<'a> {
    view: RequestView<'a>,
    target: Option<SlowRequest<'a>>,
}

struct SlowRequest<'a> {
    scope: &'a Layer,
    capture: CaptureType,
    detail: Option<DetailMetrics<'a>>,
}

impl<'a> SlowRequestConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        let target = Self::slow_request(view);
        Self { view, target }
    }

    fn slow_request(view: RequestView<'a>) -> Option<SlowRequest<'a>> {
        if !view.request.request_type().is_web() {
            return None;
        }
        let scope = view.scope_layer()?;
        let capture = view
            .agent
            .slow_request_policy()
            .capture_type(view.root.total_call_time());

        let detail = match capture {
            CaptureType::None => return None,
            CaptureType::Summary => None,
            CaptureType::Detail => Some(DetailMetrics::new(view.agent, Some(scope))),
        };
        Some(SlowRequest {
            scope,
            capture,
            detail,
        })
    }

    fn detail(&mut self) -> Option<&mut DetailMetrics<'a>> {
        self.target.as_mut().and_then(|target| target.detail.as_mut())
    }
}

fn uri(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(uri) => Some(uri.clone()),
        other => Some(other.to_string()),
    }
}

impl<'a> LayerConverter<'a> for SlowRequestConverter<'a> {
    fn name(&self) -> &'static str {
        "slow_request"
    }

    fn before(&mut self, layer: LayerNode<'a>) {
        if let Some(detail) = self.detail() {
            detail.enter(layer);
        }
    }

    fn visit(&mut self, layer: LayerNode<'a>) -> Result<(), ConvertError> {
        if let Some(detail) = self.detail() {
            detail.record(layer);
        }
        Ok(())
    }

    fn after(&mut self, layer: LayerNode<'a>) {
        if let Some(detail) = self.detail() {
            detail.leave(layer);
        }
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        let agent = self.view.agent;
        let root = self.view.root;
        let metric_name = target.scope.legacy_metric_name();

        let mut counter = MetricStats::new(false);
        counter.update(1.0, 1.0);
        let mut counters = MetricMap::new();
        counters.insert(
            MetricMeta::new(format!("SlowTransaction/{metric_name}")),
            counter,
        );
        agent.store().track(counters);

        let now = SystemTime::now();
        let total_call_time = root.total_call_time();
        let unique_name = self.view.unique_name();
        let policy = agent.slow_request_policy();
        let score = policy.score(unique_name.as_deref(), total_call_time, now);
        if let Some(name) = &unique_name {
            policy.stored(name, now);
        }

        let (metrics, allocation_metrics, truncated_metrics) = match target.detail {
            Some(detail) => detail.into_parts(),
            None => (MetricMap::new(), MetricMap::new(), false),
        };
        let transaction = SlowTransaction {
            uri: uri(self.view.request.annotations().get(URI_ANNOTATION)),
            metric_name,
            total_call_time,
            metrics,
            allocation_metrics,
            context: self.view.request.context().clone(),
            time: root
                .wall_start()
                .checked_add(total_call_time)
                .unwrap_or(now),
            allocations: root.total_allocations(),
            score,
            truncated_metrics,
            capture: target.capture,
        };
        agent.store().track_slow_transaction(transaction);
        Ok(())
    }
}
