// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric identity and aggregate values.

use crate::layer::Annotations;
use derive_more::Display;
use hashbrown::HashMap;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::hash::{Hash, Hasher};

pub type MetricMap = HashMap<MetricMeta, MetricStats>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Default)]
pub enum MetricKind {
    #[default]
    #[display("timing")]
    Timing,
    #[display("allocations")]
    Allocations,
}

/// Key of a reported metric.
///
/// Name and scope compare case-insensitively (ASCII). The backtrace and the
/// layer annotations travel with the key but are not part of its identity.
#[derive(Debug, Clone, Serialize)]
pub struct MetricMeta {
    pub metric_name: String,
    pub scope: Option<String>,
    pub desc: Option<String>,
    pub kind: MetricKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Annotations::is_empty")]
    pub extra: Annotations,
}

impl MetricMeta {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            scope: None,
            desc: None,
            kind: MetricKind::Timing,
            backtrace: None,
            extra: Annotations::new(),
        }
    }

    pub fn scoped(metric_name: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            scope: Some(scope.into()),
            ..Self::new(metric_name)
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_desc(mut self, desc: Option<String>) -> Self {
        self.desc = desc;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MetricKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_extra(mut self, extra: Annotations) -> Self {
        self.extra = extra;
        self
    }

    /// Leading segment of the name, e.g. `ActiveRecord` for `ActiveRecord/all`.
    #[must_use]
    pub fn metric_type(&self) -> &str {
        self.metric_name
            .split_once('/')
            .map_or(self.metric_name.as_str(), |(head, _)| head)
    }

    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }
}

fn eq_opt_ignore_case(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn hash_ignore_case<H: Hasher>(value: &str, state: &mut H) {
    for byte in value.bytes() {
        state.write_u8(byte.to_ascii_lowercase());
    }
    state.write_u8(0xff);
}

impl PartialEq for MetricMeta {
    fn eq(&self, other: &Self) -> bool {
        self.metric_name.eq_ignore_ascii_case(&other.metric_name)
            && eq_opt_ignore_case(self.scope.as_deref(), other.scope.as_deref())
            && self.desc == other.desc
            && self.kind == other.kind
    }
}

impl Eq for MetricMeta {}

impl Hash for MetricMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_ignore_case(&self.metric_name, state);
        match &self.scope {
            Some(scope) => {
                state.write_u8(1);
                hash_ignore_case(scope, state);
            }
            None => state.write_u8(0),
        }
        self.desc.hash(state);
        self.kind.hash(state);
    }
}

/// Count, extremes and totals of repeated observations, in seconds.
///
/// `combine` is commutative and associative, so per-request maps can be
/// merged in any order.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MetricStats {
    pub call_count: u64,
    pub min_call_time: f64,
    pub max_call_time: f64,
    pub total_call_time: f64,
    pub total_exclusive_time: f64,
    pub sum_of_squares: f64,
    /// Scoped stats track extremes over exclusive time, unscoped over call time
    #[serde(skip)]
    pub scoped: bool,
}

impl MetricStats {
    #[must_use]
    pub fn new(scoped: bool) -> Self {
        Self {
            scoped,
            ..Self::default()
        }
    }

    pub fn update(&mut self, call_time: f64, exclusive_time: f64) {
        let value = if self.scoped {
            exclusive_time
        } else {
            call_time
        };

        if self.call_count == 0 {
            self.min_call_time = value;
            self.max_call_time = value;
        } else {
            self.min_call_time = self.min_call_time.min(value);
            self.max_call_time = self.max_call_time.max(value);
        }

        self.call_count += 1;
        self.total_call_time += call_time;
        self.total_exclusive_time += exclusive_time;
        self.sum_of_squares += value * value;
    }

    /// Record `count` observations whose sums are already known.
    pub fn update_many(&mut self, count: u64, call_time: f64, exclusive_time: f64) {
        if count == 0 {
            return;
        }
        let mut other = MetricStats::new(self.scoped);
        let value = if self.scoped {
            exclusive_time
        } else {
            call_time
        };
        let mean = value / count as f64;
        other.call_count = count;
        other.min_call_time = mean;
        other.max_call_time = mean;
        other.total_call_time = call_time;
        other.total_exclusive_time = exclusive_time;
        other.sum_of_squares = mean * mean * count as f64;
        self.combine(&other);
    }

    pub fn combine(&mut self, other: &MetricStats) {
        if other.call_count == 0 {
            return;
        }
        if self.call_count == 0 {
            self.min_call_time = other.min_call_time;
            self.max_call_time = other.max_call_time;
        } else {
            self.min_call_time = self.min_call_time.min(other.min_call_time);
            self.max_call_time = self.max_call_time.max(other.max_call_time);
        }
        self.call_count += other.call_count;
        self.total_call_time += other.total_call_time;
        self.total_exclusive_time += other.total_exclusive_time;
        self.sum_of_squares += other.sum_of_squares;
    }
}

/// Merge `other` into `into`, combining stats that share a key.
pub fn merge_metrics(into: &mut MetricMap, other: MetricMap) {
    for (meta, stats) in other {
        into.entry(meta)
            .and_modify(|existing| existing.combine(&stats))
            .or_insert(stats);
    }
}

#[derive(Serialize)]
struct MetricEntry<'a> {
    meta: &'a MetricMeta,
    stats: &'a MetricStats,
}

/// Serialize a [`MetricMap`] as a list of `{meta, stats}` entries.
pub fn serialize_metric_map<S>(metrics: &MetricMap, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(metrics.len()))?;
    for (meta, stats) in metrics {
        seq.serialize_element(&MetricEntry { meta, stats })?;
    }
    seq.end()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_meta_equality_ignores_name_case() {
        let a = MetricMeta::scoped("ActiveRecord/all", "Controller/users#index");
        let b = MetricMeta::scoped("activerecord/ALL", "controller/users#INDEX");
        assert_eq!(a, b);

        let mut map = MetricMap::new();
        map.insert(a, MetricStats::new(true));
        assert!(map.contains_key(&b));
    }

    #[test]
    fn test_meta_equality_respects_desc_and_scope() {
        let base = MetricMeta::new("ActiveRecord/all");
        assert_ne!(base, base.clone().with_desc(Some("SELECT 1".to_string())));
        assert_ne!(base, base.clone().with_scope(Some("Controller/a".to_string())));
        assert_ne!(base, base.clone().with_kind(MetricKind::Allocations));
    }

    #[test]
    fn test_metric_type() {
        assert_eq!(MetricMeta::new("Errors/Request").metric_type(), "Errors");
        assert_eq!(MetricMeta::new("ActiveRecord").metric_type(), "ActiveRecord");
    }

    #[test]
    fn test_update_tracks_min_max_and_squares() {
        let mut stats = MetricStats::new(false);
        stats.update(2.0, 1.0);
        stats.update(4.0, 3.0);

        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.min_call_time, 2.0);
        assert_eq!(stats.max_call_time, 4.0);
        assert_eq!(stats.total_call_time, 6.0);
        assert_eq!(stats.total_exclusive_time, 4.0);
        assert_eq!(stats.sum_of_squares, 20.0);
    }

    #[test]
    fn test_scoped_update_uses_exclusive_time() {
        let mut stats = MetricStats::new(true);
        stats.update(2.0, 1.0);
        assert_eq!(stats.min_call_time, 1.0);
        assert_eq!(stats.sum_of_squares, 1.0);
    }

    #[test]
    fn test_update_many() {
        let mut stats = MetricStats::new(false);
        stats.update_many(4, 8.0, 6.0);
        assert_eq!(stats.call_count, 4);
        assert_eq!(stats.total_call_time, 8.0);
        assert_eq!(stats.min_call_time, 2.0);
    }

    #[test]
    fn test_combine_with_empty_keeps_extremes() {
        let mut stats = MetricStats::new(false);
        stats.update(3.0, 3.0);
        let mut empty = MetricStats::new(false);
        empty.combine(&stats);
        assert_eq!(empty, stats);
        stats.combine(&MetricStats::new(false));
        assert_eq!(stats.min_call_time, 3.0);
    }

    #[test]
    fn test_merge_metrics() {
        let meta = MetricMeta::new("Controller/a");
        let mut left = MetricMap::new();
        let mut stats = MetricStats::new(false);
        stats.update(1.0, 1.0);
        left.insert(meta.clone(), stats.clone());
        let mut right = MetricMap::new();
        right.insert(meta.clone(), stats);

        merge_metrics(&mut left, right);
        assert_eq!(left[&meta].call_count, 2);
    }

    // Integer-valued observations keep float sums exact, so equality is strict.
    fn stats_strategy() -> impl Strategy<Value = MetricStats> {
        prop::collection::vec((0u32..10_000, 0u32..10_000), 0..8).prop_map(|obs| {
            let mut stats = MetricStats::new(false);
            for (call, excl) in obs {
                stats.update(f64::from(call), f64::from(excl.min(call)));
            }
            stats
        })
    }

    fn combined(a: &MetricStats, b: &MetricStats) -> MetricStats {
        let mut out = a.clone();
        out.combine(b);
        out
    }

    proptest! {
        #[test]
        fn test_combine_is_commutative(a in stats_strategy(), b in stats_strategy()) {
            prop_assert_eq!(combined(&a, &b), combined(&b, &a));
        }

        #[test]
        fn test_combine_is_associative(
            a in stats_strategy(),
            b in stats_strategy(),
            c in stats_strategy(),
        ) {
            prop_assert_eq!(
                combined(&combined(&a, &b), &c),
                combined(&a, &combined(&b, &c))
            );
        }
    }
}
