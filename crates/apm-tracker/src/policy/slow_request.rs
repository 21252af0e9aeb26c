// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-minute budget for slow transaction traces.
//!
//! Every wall-clock minute the counters reset. A request slower than the
//! threshold is captured in detail while the detail budget lasts, then as a
//! summary, and once the overall per-minute budget is spent it is not
//! captured at all until the next minute.

use super::{minute_of, score, CaptureType, UNKNOWN_SCORE};
use crate::config::AgentConfig;
use crate::request_histograms::RequestHistograms;
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::warn;

#[derive(Debug, Default)]
struct MinuteState {
    minute: u64,
    minute_count: usize,
    detailed_count: usize,
    clipped_recording: bool,
}

#[derive(Debug)]
pub struct SlowRequestPolicy {
    threshold: Duration,
    max_per_minute: usize,
    max_detail_per_minute: usize,
    state: Mutex<MinuteState>,
    last_seen: Mutex<HashMap<String, SystemTime>>,
    zero_time: SystemTime,
    histograms: Arc<RequestHistograms>,
}

impl SlowRequestPolicy {
    #[must_use]
    pub fn new(config: &AgentConfig, histograms: Arc<RequestHistograms>) -> Self {
        Self {
            threshold: config.slow_request_threshold,
            max_per_minute: config.max_slow_per_minute,
            max_detail_per_minute: config.max_detail_per_minute.min(config.max_slow_per_minute),
            state: Mutex::new(MinuteState::default()),
            last_seen: Mutex::new(HashMap::new()),
            zero_time: SystemTime::now(),
            histograms,
        }
    }

    pub fn capture_type(&self, total_time: Duration) -> CaptureType {
        self.capture_type_at(total_time, SystemTime::now())
    }

    /// Decide how much of a request taking `total_time` to keep.
    ///
    /// The overall cap is reached once `max_per_minute` requests were counted
    /// this minute, so exactly `max_per_minute` requests are captured.
    pub fn capture_type_at(&self, total_time: Duration, now: SystemTime) -> CaptureType {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");

        let minute = minute_of(now);
        if minute != state.minute {
            *state = MinuteState {
                minute,
                ..MinuteState::default()
            };
        }

        if total_time <= self.threshold {
            return CaptureType::None;
        }

        if state.minute_count >= self.max_per_minute {
            if !state.clipped_recording {
                state.clipped_recording = true;
                warn!(
                    "Slow request limit of {} per minute reached, not capturing further slow requests this minute",
                    self.max_per_minute
                );
            }
            return CaptureType::None;
        }

        state.minute_count += 1;
        if state.detailed_count < self.max_detail_per_minute {
            state.detailed_count += 1;
            CaptureType::Detail
        } else {
            CaptureType::Summary
        }
    }

    /// How interesting a trace for `unique_name` is compared to its peers.
    ///
    /// Combines its speed, where it falls in the endpoint's latency
    /// distribution and how long since one was last stored.
    #[must_use]
    pub fn score(&self, unique_name: Option<&str>, total_time: Duration, now: SystemTime) -> f64 {
        let Some(name) = unique_name else {
            return UNKNOWN_SCORE;
        };

        let last_seen = {
            #[allow(clippy::expect_used)]
            let seen = self.last_seen.lock().expect("lock poisoned");
            seen.get(name).copied().unwrap_or(self.zero_time)
        };
        let age = now.duration_since(last_seen).unwrap_or(Duration::ZERO);
        let percentile = self
            .histograms
            .approximate_quantile_of_value(name, total_time.as_secs_f64());

        score(total_time, percentile, age)
    }

    pub fn stored(&self, unique_name: &str, now: SystemTime) {
        #[allow(clippy::expect_used)]
        let mut seen = self.last_seen.lock().expect("lock poisoned");
        seen.insert(unique_name.to_owned(), now);
    }
}
