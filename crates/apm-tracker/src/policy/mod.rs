// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared gatekeepers deciding how much of a finished request to keep.

pub mod slow_job;
pub mod slow_request;

pub use slow_job::SlowJobPolicy;
pub use slow_request::SlowRequestPolicy;

use derive_more::Display;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
pub enum CaptureType {
    #[display("capture_detail")]
    Detail,
    #[display("capture_summary")]
    Summary,
    #[display("capture_none")]
    None,
}

const POINT_MULTIPLIER_SPEED: f64 = 0.25;
const POINT_MULTIPLIER_AGE: f64 = 0.25;

/// Score given to transactions without a usable name; never worth storing.
pub const UNKNOWN_SCORE: f64 = -1.0;

/// Logarithmic so very long runs do not swamp the other components.
fn speed_points(total: Duration) -> f64 {
    total.as_secs_f64().ln_1p() * POINT_MULTIPLIER_SPEED
}

fn percentile_points(percentile: f64) -> f64 {
    if percentile < 40.0 {
        0.4
    } else if percentile < 60.0 {
        1.4
    } else if percentile < 90.0 {
        0.7
    } else {
        1.4
    }
}

fn age_points(age: Duration) -> f64 {
    age.as_secs_f64() / 60.0 * POINT_MULTIPLIER_AGE
}

pub(crate) fn score(total: Duration, percentile: f64, age: Duration) -> f64 {
    speed_points(total) + percentile_points(percentile) + age_points(age)
}

/// Whole minutes since the epoch; clocks before the epoch read as minute 0.
pub(crate) fn minute_of(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() / 60)
}
