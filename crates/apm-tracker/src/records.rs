// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-request records handed to the store, in the shape the serializer receives.

use crate::context::Context;
use crate::histogram::NumericHistogram;
use crate::metric::{serialize_metric_map, MetricMap};
use crate::metric_set::MetricSet;
use crate::policy::CaptureType;
use crate::scored_item_set::ScoredItem;
use crate::slow_item_set::SlowItem;
use serde::{Serialize, Serializer};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const RUNTIME_HISTOGRAM_SIZE: usize = 50;

fn serialize_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}

fn serialize_epoch<S: Serializer>(value: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let secs = value
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64());
    serializer.serialize_f64(secs)
}

/// Trace of one slow web request.
#[derive(Debug, Clone, Serialize)]
pub struct SlowTransaction {
    pub uri: Option<String>,
    pub metric_name: String,
    #[serde(serialize_with = "serialize_secs")]
    pub total_call_time: Duration,
    /// Detail metrics; empty for summary captures
    #[serde(serialize_with = "serialize_metric_map")]
    pub metrics: MetricMap,
    #[serde(serialize_with = "serialize_metric_map")]
    pub allocation_metrics: MetricMap,
    pub context: Context,
    #[serde(serialize_with = "serialize_epoch")]
    pub time: SystemTime,
    pub allocations: u64,
    pub score: f64,
    pub truncated_metrics: bool,
    pub capture: CaptureType,
}

impl SlowItem for SlowTransaction {
    fn metric_name(&self) -> &str {
        &self.metric_name
    }

    fn total_call_time(&self) -> Duration {
        self.total_call_time
    }
}

impl ScoredItem for SlowTransaction {
    fn name(&self) -> Option<&str> {
        Some(&self.metric_name)
    }

    fn score(&self) -> f64 {
        self.score
    }
}

/// Trace of one job run that was slow for its job.
#[derive(Debug, Clone, Serialize)]
pub struct SlowJobRecord {
    /// `"Job/{queue}/{job}"`
    pub metric_name: String,
    pub queue_name: String,
    pub job_name: String,
    #[serde(serialize_with = "serialize_epoch")]
    pub time: SystemTime,
    #[serde(serialize_with = "serialize_secs")]
    pub total_time: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub exclusive_time: Duration,
    pub context: Context,
    #[serde(serialize_with = "serialize_metric_map")]
    pub metrics: MetricMap,
    #[serde(serialize_with = "serialize_metric_map")]
    pub allocation_metrics: MetricMap,
    pub allocations: u64,
    pub score: f64,
    pub truncated_metrics: bool,
}

pub(crate) fn job_metric_name(queue_name: &str, job_name: &str) -> String {
    format!("Job/{queue_name}/{job_name}")
}

impl ScoredItem for SlowJobRecord {
    fn name(&self) -> Option<&str> {
        Some(&self.metric_name)
    }

    fn score(&self) -> f64 {
        self.score
    }
}

/// Aggregate of every run of one job during a reporting period.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub queue_name: String,
    pub job_name: String,
    pub runtime: NumericHistogram,
    pub total_exclusive_time: f64,
    pub errors: u64,
    pub metrics: MetricSet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSummary {
    pub p0: f64,
    pub p50: f64,
    pub p95: f64,
    pub p100: f64,
    pub avg: f64,
}

impl JobRecord {
    pub fn new(
        queue_name: impl Into<String>,
        job_name: impl Into<String>,
        total_time: Duration,
        exclusive_time: Duration,
        errors: u64,
        metrics: &MetricMap,
    ) -> Self {
        let mut runtime = NumericHistogram::new(RUNTIME_HISTOGRAM_SIZE);
        runtime.add(total_time.as_secs_f64());
        let mut metric_set = MetricSet::new();
        metric_set.absorb_all(metrics);
        Self {
            queue_name: queue_name.into(),
            job_name: job_name.into(),
            runtime,
            total_exclusive_time: exclusive_time.as_secs_f64(),
            errors,
            metrics: metric_set,
        }
    }

    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.queue_name.clone(), self.job_name.clone())
    }

    /// Fold in another run of the same job; runs of other jobs are refused.
    pub fn combine(&mut self, other: &JobRecord) -> bool {
        if self.queue_name != other.queue_name || self.job_name != other.job_name {
            return false;
        }
        self.metrics.combine(&other.metrics);
        self.runtime.combine(&other.runtime);
        self.total_exclusive_time += other.total_exclusive_time;
        self.errors += other.errors;
        true
    }

    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.runtime.total()
    }

    #[must_use]
    pub fn runtime_summary(&self) -> RuntimeSummary {
        RuntimeSummary {
            p0: self.runtime.quantile(0.0),
            p50: self.runtime.quantile(50.0),
            p95: self.runtime.quantile(95.0),
            p100: self.runtime.quantile(100.0),
            avg: self.runtime.mean(),
        }
    }
}
