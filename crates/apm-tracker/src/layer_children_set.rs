// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded child storage for a layer.
//!
//! Each layer type keeps up to `unique_cutoff` individual children. Children
//! of a type past that cutoff are summed into one [`MergedLayer`] for that
//! type, which is never split back apart.

use crate::layer::{Layer, LayerNode, MergedLayer};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use std::iter::FusedIterator;
use std::time::Duration;
use ustr::Ustr;

pub const DEFAULT_UNIQUE_CUTOFF: usize = 1000;

#[derive(Debug)]
pub struct LayerChildrenSet {
    unique_cutoff: usize,
    /// Individual children in call order
    children: Vec<Layer>,
    counts: HashMap<Ustr, usize, FnvBuildHasher>,
    /// One accumulator per overflowed type, in order of first overflow
    merged: Vec<MergedLayer>,
    total_call_time: Duration,
    total_allocations: u64,
}

impl Default for LayerChildrenSet {
    fn default() -> Self {
        Self::new(DEFAULT_UNIQUE_CUTOFF)
    }
}

impl LayerChildrenSet {
    #[must_use]
    pub fn new(unique_cutoff: usize) -> Self {
        Self {
            unique_cutoff,
            children: Vec::new(),
            counts: HashMap::with_hasher(FnvBuildHasher::default()),
            merged: Vec::new(),
            total_call_time: Duration::ZERO,
            total_allocations: 0,
        }
    }

    /// Add a finished child, merging it when its type is over the cutoff.
    pub fn add(&mut self, child: Layer) {
        self.total_call_time += child.total_call_time();
        self.total_allocations += child.total_allocations();

        let layer_type = child.layer_type();
        let count = self.counts.entry(layer_type).or_insert(0);
        if *count < self.unique_cutoff {
            *count += 1;
            self.children.push(child);
            return;
        }

        match self
            .merged
            .iter_mut()
            .find(|merged| merged.layer_type() == layer_type)
        {
            Some(merged) => merged.absorb(&child),
            None => {
                let mut merged = MergedLayer::new(layer_type);
                merged.absorb(&child);
                self.merged.push(merged);
            }
        }
    }

    /// Individual children first, then the merged accumulators.
    #[must_use]
    pub fn iter(&self) -> Children<'_> {
        Children {
            layers: self.children.iter(),
            merged: self.merged.iter(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len() + self.merged.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.merged.is_empty()
    }

    /// Individually stored children, in call order.
    #[must_use]
    pub fn layers(&self) -> &[Layer] {
        &self.children
    }

    #[must_use]
    pub fn merged_layers(&self) -> &[MergedLayer] {
        &self.merged
    }

    pub(crate) fn detach_layers(&mut self) -> Vec<Layer> {
        std::mem::take(&mut self.children)
    }

    /// Sum of the inclusive time of every child ever added.
    #[must_use]
    pub fn total_call_time(&self) -> Duration {
        self.total_call_time
    }

    #[must_use]
    pub fn total_allocations(&self) -> u64 {
        self.total_allocations
    }
}

impl<'a> IntoIterator for &'a LayerChildrenSet {
    type Item = LayerNode<'a>;
    type IntoIter = Children<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Debug, Clone)]
pub struct Children<'a> {
    layers: std::slice::Iter<'a, Layer>,
    merged: std::slice::Iter<'a, MergedLayer>,
}

impl<'a> Children<'a> {
    pub(crate) fn empty() -> Self {
        let layers: &'a [Layer] = &[];
        let merged: &'a [MergedLayer] = &[];
        Children {
            layers: layers.iter(),
            merged: merged.iter(),
        }
    }
}

impl<'a> Iterator for Children<'a> {
    type Item = LayerNode<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        self.layers
            .next()
            .map(LayerNode::Detailed)
            .or_else(|| self.merged.next().map(LayerNode::Merged))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.layers.len() + self.merged.len();
        (len, Some(len))
    }
}

/// Trees can be arbitrarily deep; free them level by level.
impl Drop for LayerChildrenSet {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut layer) = pending.pop() {
            pending.append(&mut layer.detach_children());
        }
    }
}

impl ExactSizeIterator for Children<'_> {}

impl FusedIterator for Children<'_> {}
