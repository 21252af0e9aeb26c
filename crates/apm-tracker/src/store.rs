// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Destination of everything a finished request produces.
//!
//! Data is grouped into one-minute reporting periods. A period is drained
//! once its minute is over, producing the payload the serializer receives.

use crate::config::AgentConfig;
use crate::db_query::DbQueryMetricSet;
use crate::metric::MetricMap;
use crate::metric_set::MetricSet;
use crate::policy::minute_of;
use crate::records::{JobRecord, SlowJobRecord, SlowTransaction};
use crate::scored_item_set::ScoredItemSet;
use crate::slow_item_set::SlowTransactionSet;
use hashbrown::HashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

/// Receiver of converter output. Calls must not block the request.
pub trait Store: Send + Sync {
    fn track(&self, metrics: MetricMap);
    fn track_slow_transaction(&self, transaction: SlowTransaction);
    fn track_slow_job(&self, job: SlowJobRecord);
    fn track_job(&self, job: JobRecord);
    fn track_db_query_metrics(&self, metrics: DbQueryMetricSet);
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PeriodLimits {
    slow_set_total: usize,
    slow_set_fair: usize,
    scored_set_max_size: usize,
}

impl From<&AgentConfig> for PeriodLimits {
    fn from(config: &AgentConfig) -> Self {
        Self {
            slow_set_total: config.slow_set_total,
            slow_set_fair: config.slow_set_fair,
            scored_set_max_size: config.scored_set_max_size,
        }
    }
}

/// Everything tracked during one minute.
#[derive(Debug)]
pub struct StoreReportingPeriod {
    minute: u64,
    metric_set: MetricSet,
    slow_transactions: SlowTransactionSet,
    slow_jobs: ScoredItemSet<SlowJobRecord>,
    jobs: HashMap<(String, String), JobRecord>,
    db_query_metrics: DbQueryMetricSet,
}

impl StoreReportingPeriod {
    fn new(minute: u64, limits: PeriodLimits) -> Self {
        Self {
            minute,
            metric_set: MetricSet::new(),
            slow_transactions: SlowTransactionSet::new(
                limits.slow_set_total,
                limits.slow_set_fair,
            ),
            slow_jobs: ScoredItemSet::new(limits.scored_set_max_size, true),
            jobs: HashMap::new(),
            db_query_metrics: DbQueryMetricSet::new(),
        }
    }

    fn absorb_job(&mut self, job: JobRecord) {
        match self.jobs.get_mut(&job.key()) {
            Some(existing) => {
                existing.combine(&job);
            }
            None => {
                self.jobs.insert(job.key(), job);
            }
        }
    }

    fn into_payload(self) -> ReportingPeriodPayload {
        ReportingPeriodPayload {
            timestamp: self.minute * 60,
            metrics: self.metric_set,
            slow_transactions: self.slow_transactions.into_items(),
            slow_jobs: self.slow_jobs.into_items(),
            jobs: self.jobs.into_values().collect(),
            db_query_metrics: self.db_query_metrics,
        }
    }
}

/// Data of one finished reporting period, ready to serialize.
#[derive(Debug, Serialize)]
pub struct ReportingPeriodPayload {
    /// Start of the period, in seconds since the epoch
    pub timestamp: u64,
    pub metrics: MetricSet,
    pub slow_transactions: Vec<SlowTransaction>,
    pub slow_jobs: Vec<SlowJobRecord>,
    pub jobs: Vec<JobRecord>,
    pub db_query_metrics: DbQueryMetricSet,
}

/// Reporting periods held in memory, owned by a single caller.
#[derive(Debug)]
pub struct ReportingPeriods {
    limits: PeriodLimits,
    periods: BTreeMap<u64, StoreReportingPeriod>,
}

impl ReportingPeriods {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            limits: PeriodLimits::from(config),
            periods: BTreeMap::new(),
        }
    }

    fn period_at(&mut self, now: SystemTime) -> &mut StoreReportingPeriod {
        let minute = minute_of(now);
        let limits = self.limits;
        self.periods
            .entry(minute)
            .or_insert_with(|| StoreReportingPeriod::new(minute, limits))
    }

    pub fn track_at(&mut self, metrics: &MetricMap, now: SystemTime) {
        self.period_at(now).metric_set.absorb_all(metrics);
    }

    pub fn track_slow_transaction_at(&mut self, transaction: SlowTransaction, now: SystemTime) {
        let period = self.period_at(now);
        if !period.slow_transactions.push(transaction) {
            debug!("Slow transaction dropped, reporting period is full");
        }
    }

    pub fn track_slow_job_at(&mut self, job: SlowJobRecord, now: SystemTime) {
        self.period_at(now).slow_jobs.insert(job);
    }

    pub fn track_job_at(&mut self, job: JobRecord, now: SystemTime) {
        self.period_at(now).absorb_job(job);
    }

    pub fn track_db_query_metrics_at(&mut self, metrics: DbQueryMetricSet, now: SystemTime) {
        self.period_at(now).db_query_metrics.combine(metrics);
    }

    /// Remove and return every period whose minute has ended by `now`.
    pub fn drain_ready(&mut self, now: SystemTime) -> Vec<ReportingPeriodPayload> {
        let current = minute_of(now);
        let pending = self.periods.split_off(&current);
        let ready = std::mem::replace(&mut self.periods, pending);
        ready.into_values().map(StoreReportingPeriod::into_payload).collect()
    }

    pub fn drain_all(&mut self) -> Vec<ReportingPeriodPayload> {
        std::mem::take(&mut self.periods)
            .into_values()
            .map(StoreReportingPeriod::into_payload)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }
}

/// Thread-safe [`Store`] keeping reporting periods in memory.
#[derive(Debug)]
pub struct InMemoryStore {
    periods: Mutex<ReportingPeriods>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            periods: Mutex::new(ReportingPeriods::new(config)),
        }
    }

    fn with_periods<T>(&self, f: impl FnOnce(&mut ReportingPeriods) -> T) -> T {
        #[allow(clippy::expect_used)]
        let mut periods = self.periods.lock().expect("lock poisoned");
        f(&mut periods)
    }

    pub fn drain_ready(&self, now: SystemTime) -> Vec<ReportingPeriodPayload> {
        self.with_periods(|periods| periods.drain_ready(now))
    }

    pub fn drain_all(&self) -> Vec<ReportingPeriodPayload> {
        self.with_periods(ReportingPeriods::drain_all)
    }
}

impl Store for InMemoryStore {
    fn track(&self, metrics: MetricMap) {
        self.with_periods(|periods| periods.track_at(&metrics, SystemTime::now()));
    }

    fn track_slow_transaction(&self, transaction: SlowTransaction) {
        self.with_periods(|periods| {
            periods.track_slow_transaction_at(transaction, SystemTime::now());
        });
    }

    fn track_slow_job(&self, job: SlowJobRecord) {
        self.with_periods(|periods| periods.track_slow_job_at(job, SystemTime::now()));
    }

    fn track_job(&self, job: JobRecord) {
        self.with_periods(|periods| periods.track_job_at(job, SystemTime::now()));
    }

    fn track_db_query_metrics(&self, metrics: DbQueryMetricSet) {
        self.with_periods(|periods| periods.track_db_query_metrics_at(metrics, SystemTime::now()));
    }
}
