// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;
use crate::metric::{MetricMap, MetricMeta, MetricStats};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};

/// Headers set by a load balancer or proxy when it received the request,
/// in lookup order.
pub const QUEUE_HEADERS: [&str; 6] = [
    "X-Queue-Start",
    "X-Request-Start",
    "X-QUEUE-START",
    "X-REQUEST-START",
    "x-queue-start",
    "x-request-start",
];

/// Queue times above this many seconds are reported but look like a clock
/// or header format problem.
const SUSPICIOUS_QUEUE_SECS: f64 = 10_000.0;

/// Time a web request waited upstream before reaching the application.
pub struct RequestQueueTimeConverter<'a> {
    view: RequestView<'a>,
}

impl<'a> RequestQueueTimeConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        Self { view }
    }

    fn locate_timestamp(&self) -> Option<&'a str> {
        let headers = self.view.request.headers()?;
        QUEUE_HEADERS
            .iter()
            .find_map(|name| headers.get(*name))
            .map(String::as_str)
    }
}

/// Seconds since the epoch from a queue header value.
///
/// Accepts `t=` prefixed values and values with or without a decimal point:
/// the first 10 digits are seconds and up to 13 more are the fraction.
pub(crate) fn parse_queue_start(raw: &str) -> Option<f64> {
    let digits: String = raw
        .replace("t=", "")
        .chars()
        .filter(|c| *c != '.')
        .collect();
    let secs: String = digits.chars().take(10).collect();
    let fraction: String = digits.chars().skip(10).take(13).collect();

    let value = if fraction.is_empty() {
        secs
    } else {
        format!("{secs}.{fraction}")
    };
    value.trim().parse::<f64>().ok()
}

impl<'a> LayerConverter<'a> for RequestQueueTimeConverter<'a> {
    fn name(&self) -> &'static str {
        "queue_time"
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if !self.view.request.request_type().is_web() {
            return Ok(());
        }
        let Some(scope_layer) = self.view.scope_layer() else {
            return Ok(());
        };
        let Some(raw) = self.locate_timestamp() else {
            return Ok(());
        };
        let Some(queue_start) = parse_queue_start(raw) else {
            debug!("Unparseable queue start header: {raw:?}");
            return Ok(());
        };

        let request_start = self
            .view
            .root
            .wall_start()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |elapsed| elapsed.as_secs_f64());
        let queue_time = request_start - queue_start;
        if queue_time < 0.0 {
            info!("Ignoring negative queue time of {queue_time:.3}s");
            return Ok(());
        }
        if queue_time > SUSPICIOUS_QUEUE_SECS {
            info!("Queue time of {queue_time:.0}s is unusually large, check the {raw:?} header");
        }

        let mut stats = MetricStats::new(true);
        stats.update(queue_time, queue_time);
        let mut metrics = MetricMap::new();
        metrics.insert(
            MetricMeta::scoped("QueueTime/Request", scope_layer.legacy_metric_name()),
            stats,
        );
        self.view.agent.store().track(metrics);
        Ok(())
    }
}
