// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Repeated-call tracking for N+1 detection.
//!
//! A parent layer keeps one [`CallSet`] per child operation name. Once the
//! same operation (or the same description of it) has been seen exactly
//! `magic_number` times, a single backtrace is worth capturing.

use fnv::FnvBuildHasher;
use hashbrown::HashMap;

pub const DEFAULT_N_PLUS_ONE_MAGIC_NUMBER: usize = 5;

#[derive(Debug, Clone)]
pub struct CallSet {
    magic_number: usize,
    call_count: usize,
    /// Raw descriptions, kept only until the grouping below is built
    items: Vec<String>,
    last_item: Option<String>,
    grouped_items: Option<HashMap<String, usize, FnvBuildHasher>>,
    captured: bool,
}

impl Default for CallSet {
    fn default() -> Self {
        Self::new(DEFAULT_N_PLUS_ONE_MAGIC_NUMBER)
    }
}

impl CallSet {
    #[must_use]
    pub fn new(magic_number: usize) -> Self {
        Self {
            magic_number: magic_number.max(1),
            call_count: 0,
            items: Vec::new(),
            last_item: None,
            grouped_items: None,
            captured: false,
        }
    }

    /// Record one more call, optionally with its description.
    ///
    /// Nothing is tracked once a backtrace has been captured for this set.
    pub fn update(&mut self, desc: Option<&str>) {
        if self.captured {
            return;
        }
        self.call_count += 1;

        let Some(desc) = desc else {
            return;
        };
        match self.grouped_items.as_mut() {
            Some(grouped) => *grouped.entry_ref(desc).or_insert(0) += 1,
            None => self.items.push(desc.to_owned()),
        }
        self.last_item = Some(desc.to_owned());
    }

    /// True exactly once: on the call that brings the set (or the group of the
    /// latest description) to `magic_number` occurrences.
    pub fn capture_backtrace(&mut self) -> bool {
        if self.captured || self.call_count < self.magic_number {
            return false;
        }

        let fire = if self.has_descriptions() {
            self.at_magic_number_for_last_item()
        } else {
            self.call_count == self.magic_number
        };

        if fire {
            self.captured = true;
        }
        fire
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count
    }

    #[must_use]
    pub fn captured(&self) -> bool {
        self.captured
    }

    fn has_descriptions(&self) -> bool {
        self.last_item.is_some()
    }

    fn at_magic_number_for_last_item(&mut self) -> bool {
        let grouped = self.grouped_items.get_or_insert_with(|| {
            let mut grouped = HashMap::with_hasher(FnvBuildHasher::default());
            for item in self.items.drain(..) {
                *grouped.entry(item).or_insert(0) += 1;
            }
            grouped
        });

        self.last_item
            .as_deref()
            .and_then(|last| grouped.get(last))
            .is_some_and(|count| *count == self.magic_number)
    }
}
