// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for unit tests.

use crate::agent::AgentContext;
use crate::backtrace::BacktraceSource;
use crate::config::AgentConfig;
use crate::converters::walker::walk;
use crate::converters::{ConverterRunner, LayerConverter, RequestView};
use crate::db_query::DbQueryMetricSet;
use crate::layer::Layer;
use crate::metric::{merge_metrics, MetricMap};
use crate::records::{JobRecord, SlowJobRecord, SlowTransaction};
use crate::store::Store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Store keeping everything it receives, in order.
#[derive(Debug, Default)]
pub(crate) struct RecordingStore {
    pub(crate) metrics: Mutex<Vec<MetricMap>>,
    pub(crate) slow_transactions: Mutex<Vec<SlowTransaction>>,
    pub(crate) slow_jobs: Mutex<Vec<SlowJobRecord>>,
    pub(crate) jobs: Mutex<Vec<JobRecord>>,
    pub(crate) db_query_metrics: Mutex<Vec<DbQueryMetricSet>>,
}

impl RecordingStore {
    /// Every tracked metric map merged into one.
    pub(crate) fn merged_metrics(&self) -> MetricMap {
        let mut merged = MetricMap::new();
        for metrics in self.metrics.lock().unwrap().iter() {
            merge_metrics(&mut merged, metrics.clone());
        }
        merged
    }

    pub(crate) fn track_count(&self) -> usize {
        self.metrics.lock().unwrap().len()
    }
}

impl Store for RecordingStore {
    fn track(&self, metrics: MetricMap) {
        self.metrics.lock().unwrap().push(metrics);
    }

    fn track_slow_transaction(&self, transaction: SlowTransaction) {
        self.slow_transactions.lock().unwrap().push(transaction);
    }

    fn track_slow_job(&self, job: SlowJobRecord) {
        self.slow_jobs.lock().unwrap().push(job);
    }

    fn track_job(&self, job: JobRecord) {
        self.jobs.lock().unwrap().push(job);
    }

    fn track_db_query_metrics(&self, metrics: DbQueryMetricSet) {
        self.db_query_metrics.lock().unwrap().push(metrics);
    }
}

/// Backtrace source returning fixed frames and counting captures.
#[derive(Debug, Default)]
pub(crate) struct FixedBacktraces {
    pub(crate) captures: AtomicUsize,
}

impl BacktraceSource for FixedBacktraces {
    fn capture(&self) -> Vec<String> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        vec![
            "/srv/app/app/models/user.rb:12:in `find`".to_string(),
            "/usr/lib/ruby/gems/activerecord/base.rb:40".to_string(),
        ]
    }
}

pub(crate) fn agent_with(config: AgentConfig) -> (Arc<AgentContext>, Arc<RecordingStore>) {
    let store = Arc::new(RecordingStore::default());
    let agent = Arc::new(AgentContext::new(config, store.clone()));
    (agent, store)
}

/// Agent whose backtraces come from a counting [`FixedBacktraces`].
pub(crate) fn agent_with_backtraces(
    config: AgentConfig,
) -> (Arc<AgentContext>, Arc<RecordingStore>, Arc<FixedBacktraces>) {
    let store = Arc::new(RecordingStore::default());
    let source = Arc::new(FixedBacktraces::default());
    let agent = AgentContext::new(config, store.clone()).with_backtrace_source(source.clone());
    (Arc::new(agent), store, source)
}

pub(crate) fn stopped(layer_type: &str, name: &str, start: Instant, millis: u64) -> Layer {
    let mut layer = Layer::new(layer_type, name, start);
    layer.record_stop_time(start + Duration::from_millis(millis));
    layer
}

/// Walk `view` with a single converter and record it.
pub(crate) fn run<'a>(view: RequestView<'a>, converter: Box<dyn LayerConverter<'a> + 'a>) {
    let mut runner = ConverterRunner::new(vec![converter]);
    walk(view.root, &mut runner);
    runner.record_all();
}
