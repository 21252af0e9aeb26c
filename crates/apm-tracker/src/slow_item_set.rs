// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded sample of slow items spread fairly across names.

use crate::records::SlowTransaction;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_TOTAL: usize = 10;
pub const DEFAULT_FAIR: usize = 1;

pub trait SlowItem {
    fn metric_name(&self) -> &str;
    fn total_call_time(&self) -> Duration;
}

/// Holds up to `total` items. When full, the name with the most entries gives
/// up its fastest one, provided it holds more than `fair` entries; otherwise
/// the newcomer is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct SlowItemSet<T> {
    total: usize,
    fair: usize,
    items: Vec<T>,
}

pub type SlowTransactionSet = SlowItemSet<SlowTransaction>;

impl<T: SlowItem> Default for SlowItemSet<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL, DEFAULT_FAIR)
    }
}

impl<T: SlowItem> SlowItemSet<T> {
    #[must_use]
    pub fn new(total: usize, fair: usize) -> Self {
        Self {
            total,
            fair,
            items: Vec::with_capacity(total),
        }
    }

    /// Offer an item; returns whether it was stored.
    pub fn push(&mut self, item: T) -> bool {
        if self.has_empty_slot() {
            self.items.push(item);
            return true;
        }

        let Some((name, count)) = self.most_common_name() else {
            return false;
        };
        if count <= self.fair {
            debug!(
                "Dropping slow item {}, every name is at its fair share",
                item.metric_name()
            );
            return false;
        }

        if let Some(idx) = self.fastest_of(&name) {
            self.items.remove(idx);
        }
        if self.has_empty_slot() {
            self.items.push(item);
            true
        } else {
            false
        }
    }

    fn has_empty_slot(&self) -> bool {
        self.items.len() < self.total
    }

    /// Name with the most entries; ties go to the name seen first.
    fn most_common_name(&self) -> Option<(String, usize)> {
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for item in &self.items {
            match counts.iter_mut().find(|(name, _)| *name == item.metric_name()) {
                Some((_, count)) => *count += 1,
                None => counts.push((item.metric_name(), 1)),
            }
        }

        let mut best: Option<(&str, usize)> = None;
        for (name, count) in counts {
            if best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((name, count));
            }
        }
        best.map(|(name, count)| (name.to_owned(), count))
    }

    fn fastest_of(&self, name: &str) -> Option<usize> {
        let mut fastest: Option<usize> = None;
        for (idx, item) in self.items.iter().enumerate() {
            if item.metric_name() != name {
                continue;
            }
            match fastest {
                Some(current)
                    if self.items[current].total_call_time() <= item.total_call_time() => {}
                _ => fastest = Some(idx),
            }
        }
        fastest
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}
