// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide state shared by every tracked request.

use crate::backtrace::{
    AllocationSource, BacktraceParser, BacktraceSource, NoopAllocationSource, StdBacktraceSource,
};
use crate::config::AgentConfig;
use crate::policy::{SlowJobPolicy, SlowRequestPolicy};
use crate::request_histograms::RequestHistograms;
use crate::store::Store;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

pub struct AgentContext {
    config: AgentConfig,
    slow_request_policy: SlowRequestPolicy,
    slow_job_policy: SlowJobPolicy,
    request_histograms: Arc<RequestHistograms>,
    store: Arc<dyn Store>,
    backtrace_source: Arc<dyn BacktraceSource>,
    backtrace_parser: Option<BacktraceParser>,
    allocation_source: Arc<dyn AllocationSource>,
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("config", &self.config)
            .field("backtrace_source", &self.backtrace_source)
            .field("allocation_source", &self.allocation_source)
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    /// Shared state with the default backtrace and allocation sources.
    pub fn new(config: AgentConfig, store: Arc<dyn Store>) -> Self {
        let config = config.sanitized();
        let request_histograms = Arc::new(RequestHistograms::new(config.histogram_buckets));
        let backtrace_parser = config.app_root.as_deref().and_then(|root| {
            BacktraceParser::new(root)
                .map_err(|e| warn!("Backtraces will not be trimmed to the app root: {e}"))
                .ok()
        });

        Self {
            slow_request_policy: SlowRequestPolicy::new(&config, Arc::clone(&request_histograms)),
            slow_job_policy: SlowJobPolicy::new(config.histogram_buckets),
            request_histograms,
            store,
            backtrace_source: Arc::new(StdBacktraceSource),
            backtrace_parser,
            allocation_source: Arc::new(NoopAllocationSource),
            config,
        }
    }

    #[must_use]
    pub fn with_backtrace_source(mut self, source: Arc<dyn BacktraceSource>) -> Self {
        self.backtrace_source = source;
        self
    }

    #[must_use]
    pub fn with_allocation_source(mut self, source: Arc<dyn AllocationSource>) -> Self {
        self.allocation_source = source;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn slow_request_policy(&self) -> &SlowRequestPolicy {
        &self.slow_request_policy
    }

    #[must_use]
    pub fn slow_job_policy(&self) -> &SlowJobPolicy {
        &self.slow_job_policy
    }

    #[must_use]
    pub fn request_histograms(&self) -> &RequestHistograms {
        &self.request_histograms
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Raw frames of the current call stack.
    #[must_use]
    pub fn capture_backtrace(&self) -> Vec<String> {
        self.backtrace_source.capture()
    }

    /// Frames from the application's own code when an app root is configured,
    /// otherwise the raw frames.
    #[must_use]
    pub fn clean_backtrace(&self, frames: &[String]) -> Vec<String> {
        match &self.backtrace_parser {
            Some(parser) => parser.parse(frames),
            None => frames.to_vec(),
        }
    }

    #[must_use]
    pub fn allocations(&self) -> u64 {
        if self.config.track_allocations {
            self.allocation_source.allocations()
        } else {
            0
        }
    }
}
