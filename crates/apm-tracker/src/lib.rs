// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request tracking core of an application performance monitoring agent.
//!
//! Instrumentation opens and closes layers on the [`TrackedRequest`] of the
//! current thread or task (see [`request_manager`]). When the outermost layer
//! closes, the finished call tree is walked once by the
//! [`converters`], which turn it into metrics, slow transaction and slow job
//! traces, job records and database query statistics. Those are handed to a
//! [`Store`], typically the [`StoreService`] actor, which groups them into
//! minute-long reporting periods.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod agent;
pub mod backtrace;
pub mod call_set;
pub mod config;
pub mod context;
pub mod converters;
pub mod db_query;
pub mod errors;
pub mod histogram;
pub mod layer;
pub mod layer_children_set;
pub mod logger;
pub mod metric;
pub mod metric_set;
pub mod policy;
pub mod records;
pub mod request_histograms;
pub mod request_manager;
pub mod scored_item_set;
pub mod slow_item_set;
pub mod store;
pub mod store_service;
pub mod tracked_request;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::AgentContext;
pub use config::AgentConfig;
pub use errors::{ConfigError, ContextError, ConvertError, LoggerError, StoreError};
pub use layer::{Layer, LayerName};
pub use store::{InMemoryStore, ReportingPeriodPayload, Store};
pub use store_service::{StoreHandle, StoreService};
pub use tracked_request::{LayerHandle, RequestType, TrackedRequest};
