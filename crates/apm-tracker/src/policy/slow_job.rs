// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{score, UNKNOWN_SCORE};
use crate::histogram::NumericHistogram;
use hashbrown::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Percentile against which a job run is compared.
pub const QUANTILE: f64 = 95.0;

/// Marks job runs as slow relative to each job's own history.
#[derive(Debug)]
pub struct SlowJobPolicy {
    buckets: usize,
    histograms: Mutex<HashMap<String, NumericHistogram>>,
    last_seen: Mutex<HashMap<String, SystemTime>>,
    zero_time: SystemTime,
}

impl SlowJobPolicy {
    #[must_use]
    pub fn new(buckets: usize) -> Self {
        Self {
            buckets,
            histograms: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
            zero_time: SystemTime::now(),
        }
    }

    /// Record a run of `name` and report whether it reached the 95th
    /// percentile of the runs seen before it. The first run is never slow.
    pub fn slow(&self, name: &str, total_time: Duration) -> bool {
        let value = total_time.as_secs_f64();

        #[allow(clippy::expect_used)]
        let mut histograms = self.histograms.lock().expect("lock poisoned");
        let histogram = histograms
            .entry_ref(name)
            .or_insert_with(|| NumericHistogram::new(self.buckets));

        let slow = !histogram.is_empty() && value >= histogram.quantile(QUANTILE);
        histogram.add(value);
        slow
    }

    #[must_use]
    pub fn score(&self, name: Option<&str>, total_time: Duration, now: SystemTime) -> f64 {
        let Some(name) = name else {
            return UNKNOWN_SCORE;
        };

        let percentile = {
            #[allow(clippy::expect_used)]
            let histograms = self.histograms.lock().expect("lock poisoned");
            histograms.get(name).map_or(100.0, |hist| {
                hist.approximate_quantile_of_value(total_time.as_secs_f64())
            })
        };
        let last_seen = {
            #[allow(clippy::expect_used)]
            let seen = self.last_seen.lock().expect("lock poisoned");
            seen.get(name).copied().unwrap_or(self.zero_time)
        };
        let age = now.duration_since(last_seen).unwrap_or(Duration::ZERO);

        score(total_time, percentile, age)
    }

    pub fn stored(&self, name: &str, now: SystemTime) {
        #[allow(clippy::expect_used)]
        let mut seen = self.last_seen.lock().expect("lock poisoned");
        seen.insert(name.to_owned(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: f64) -> Duration {
        Duration::from_secs_f64(n)
    }

    #[test]
    fn test_first_call_is_not_slow() {
        let policy = SlowJobPolicy::new(50);
        assert!(!policy.slow("TestWorker", secs(10.0)));
    }

    #[test]
    fn test_fast_calls_are_not_slow() {
        let policy = SlowJobPolicy::new(50);
        for t in [10.0, 8.0, 6.0, 4.0, 2.0] {
            assert!(!policy.slow("TestWorker", secs(t)));
        }
    }

    #[test]
    fn test_slow_calls_are_marked_as_slow() {
        let policy = SlowJobPolicy::new(50);
        policy.slow("TestWorker", secs(10.0));
        for t in [12.0, 14.0, 16.0, 18.0] {
            assert!(policy.slow("TestWorker", secs(t)));
        }
    }

    #[test]
    fn test_compares_against_prior_runs_only() {
        let policy = SlowJobPolicy::new(50);
        policy.slow("TestWorker", secs(10.0));

        assert!(policy.slow("TestWorker", secs(12.0)));
        assert!(!policy.slow("TestWorker", secs(8.0)));
        // The 95th percentile of [8, 10, 12] is 12
        assert!(!policy.slow("TestWorker", secs(11.0)));
        assert!(!policy.slow("TestWorker", secs(6.0)));
        assert!(policy.slow("TestWorker", secs(12.0)));
    }

    #[test]
    fn test_different_workers_dont_interfere() {
        let policy = SlowJobPolicy::new(50);
        policy.slow("TestWorker", secs(10.0));
        policy.slow("OtherWorker", secs(1.0));

        assert!(!policy.slow("TestWorker", secs(8.0)));
        assert!(policy.slow("OtherWorker", secs(2.0)));
        assert!(!policy.slow("TestWorker", secs(1.0)));
        assert!(policy.slow("OtherWorker", secs(3.0)));
        assert!(policy.slow("TestWorker", secs(12.0)));
        assert!(!policy.slow("OtherWorker", secs(1.0)));
        assert!(policy.slow("OtherWorker", secs(4.0)));
    }

    #[test]
    fn test_score() {
        let policy = SlowJobPolicy::new(50);
        assert_eq!(policy.score(None, secs(1.0), SystemTime::now()), UNKNOWN_SCORE);

        policy.slow("Job/default/Mailer", secs(1.0));
        let now = SystemTime::now();
        policy.stored("Job/default/Mailer", now);
        let score = policy.score(Some("Job/default/Mailer"), secs(3.0), now);
        assert!((score - (4f64.ln() * 0.25 + 1.4)).abs() < 1e-9);
    }
}
