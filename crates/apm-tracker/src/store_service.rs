// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Store running as a tokio task.
//!
//! Request threads only enqueue commands through a [`StoreHandle`]; the
//! [`StoreService`] owns the reporting periods and is the single writer.

use crate::config::AgentConfig;
use crate::db_query::DbQueryMetricSet;
use crate::errors::StoreError;
use crate::metric::MetricMap;
use crate::records::{JobRecord, SlowJobRecord, SlowTransaction};
use crate::store::{ReportingPeriodPayload, ReportingPeriods, Store};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

#[derive(Debug)]
pub enum StoreCommand {
    Track(MetricMap),
    TrackSlowTransaction(SlowTransaction),
    TrackSlowJob(SlowJobRecord),
    TrackJob(JobRecord),
    TrackDbQueryMetrics(DbQueryMetricSet),
    /// Drain finished periods, or every period when `all` is set
    Flush {
        all: bool,
        response_tx: oneshot::Sender<Vec<ReportingPeriodPayload>>,
    },
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<StoreCommand>,
}

impl StoreHandle {
    fn send(&self, command: StoreCommand) {
        if let Err(e) = self.tx.send(command) {
            error!("Failed to send store command: {}", e);
        }
    }

    pub async fn flush(&self) -> Result<Vec<ReportingPeriodPayload>, StoreError> {
        self.request_flush(false).await
    }

    pub async fn flush_all(&self) -> Result<Vec<ReportingPeriodPayload>, StoreError> {
        self.request_flush(true).await
    }

    async fn request_flush(&self, all: bool) -> Result<Vec<ReportingPeriodPayload>, StoreError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::Flush { all, response_tx })
            .map_err(|_| StoreError::Closed)?;

        response_rx
            .await
            .map_err(|e| StoreError::Flush(e.to_string()))
    }

    pub fn shutdown(&self) -> Result<(), StoreError> {
        self.tx
            .send(StoreCommand::Shutdown)
            .map_err(|_| StoreError::Closed)
    }
}

impl Store for StoreHandle {
    fn track(&self, metrics: MetricMap) {
        self.send(StoreCommand::Track(metrics));
    }

    fn track_slow_transaction(&self, transaction: SlowTransaction) {
        self.send(StoreCommand::TrackSlowTransaction(transaction));
    }

    fn track_slow_job(&self, job: SlowJobRecord) {
        self.send(StoreCommand::TrackSlowJob(job));
    }

    fn track_job(&self, job: JobRecord) {
        self.send(StoreCommand::TrackJob(job));
    }

    fn track_db_query_metrics(&self, metrics: DbQueryMetricSet) {
        self.send(StoreCommand::TrackDbQueryMetrics(metrics));
    }
}

pub struct StoreService {
    periods: ReportingPeriods,
    rx: mpsc::UnboundedReceiver<StoreCommand>,
}

impl StoreService {
    #[must_use]
    pub fn new(config: &AgentConfig) -> (Self, StoreHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            periods: ReportingPeriods::new(config),
            rx,
        };
        (service, StoreHandle { tx })
    }

    pub async fn run(mut self) {
        debug!("Store service started");

        while let Some(command) = self.rx.recv().await {
            let now = SystemTime::now();
            match command {
                StoreCommand::Track(metrics) => self.periods.track_at(&metrics, now),
                StoreCommand::TrackSlowTransaction(transaction) => {
                    self.periods.track_slow_transaction_at(transaction, now);
                }
                StoreCommand::TrackSlowJob(job) => self.periods.track_slow_job_at(job, now),
                StoreCommand::TrackJob(job) => self.periods.track_job_at(job, now),
                StoreCommand::TrackDbQueryMetrics(metrics) => {
                    self.periods.track_db_query_metrics_at(metrics, now);
                }
                StoreCommand::Flush { all, response_tx } => {
                    let payload = if all {
                        self.periods.drain_all()
                    } else {
                        self.periods.drain_ready(now)
                    };
                    if response_tx.send(payload).is_err() {
                        error!("Failed to send flush response - receiver dropped");
                    }
                }
                StoreCommand::Shutdown => {
                    debug!("Store service shutting down");
                    break;
                }
            }
        }

        debug!("Store service stopped");
    }
}
