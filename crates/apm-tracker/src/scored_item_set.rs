// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded top-N container ordered by score.

use serde::Serialize;

pub const DEFAULT_MAX_SIZE: usize = 10;

/// Item that can compete for a slot in a [`ScoredItemSet`].
pub trait ScoredItem {
    /// `None` marks an item that must never be stored.
    fn name(&self) -> Option<&str>;
    fn score(&self) -> f64;
}

#[derive(Debug, Clone, Serialize)]
struct Entry<T> {
    name: String,
    score: f64,
    /// Insertion order, replacements included
    #[serde(skip)]
    seq: u64,
    item: T,
}

/// Keeps the `max_size` highest scoring items seen.
///
/// With `unique` set, at most one item per name is kept and a newcomer only
/// replaces it with a strictly higher score. Ties never evict: when several
/// entries share the lowest score, the most recently inserted one is the
/// eviction candidate, so the earliest of equal scores stays. Slots are
/// reused on eviction, so insertion order is tracked apart from position.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredItemSet<T> {
    max_size: usize,
    unique: bool,
    entries: Vec<Entry<T>>,
    #[serde(skip)]
    next_seq: u64,
}

impl<T: ScoredItem> Default for ScoredItemSet<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, true)
    }
}

impl<T: ScoredItem> ScoredItemSet<T> {
    #[must_use]
    pub fn new(max_size: usize, unique: bool) -> Self {
        Self {
            max_size,
            unique,
            entries: Vec::with_capacity(max_size),
            next_seq: 0,
        }
    }

    /// Offer an item; returns whether it was stored.
    pub fn insert(&mut self, item: T) -> bool {
        let Some(name) = item.name().map(str::to_owned) else {
            return false;
        };
        let score = item.score();
        if score.is_nan() {
            return false;
        }

        let seq = self.next_seq;
        if self.unique {
            if let Some(existing) = self.entries.iter_mut().find(|e| e.name == name) {
                if score > existing.score {
                    *existing = Entry {
                        name,
                        score,
                        seq,
                        item,
                    };
                    self.next_seq += 1;
                    return true;
                }
                return false;
            }
        }

        if self.entries.len() < self.max_size {
            self.entries.push(Entry {
                name,
                score,
                seq,
                item,
            });
            self.next_seq += 1;
            return true;
        }

        let Some(min_idx) = self.eviction_candidate() else {
            return false;
        };
        if self.entries[min_idx].score < score {
            self.entries[min_idx] = Entry {
                name,
                score,
                seq,
                item,
            };
            self.next_seq += 1;
            true
        } else {
            false
        }
    }

    /// Lowest score, latest inserted among equal scores.
    fn eviction_candidate(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.score.total_cmp(&b.score).then(b.seq.cmp(&a.seq)))
            .map(|(idx, _)| idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|entry| &entry.item)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn into_items(self) -> Vec<T> {
        self.entries.into_iter().map(|entry| entry.item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Scored {
        name: Option<String>,
        score: f64,
        tag: usize,
    }

    fn item(name: &str, score: f64) -> Scored {
        Scored {
            name: Some(name.to_string()),
            score,
            tag: 0,
        }
    }

    impl ScoredItem for Scored {
        fn name(&self) -> Option<&str> {
            self.name.as_deref()
        }

        fn score(&self) -> f64 {
            self.score
        }
    }

    fn scores(set: &ScoredItemSet<Scored>) -> Vec<f64> {
        let mut scores: Vec<f64> = set.iter().map(|i| i.score).collect();
        scores.sort_by(|a, b| b.total_cmp(a));
        scores
    }

    #[test]
    fn test_keeps_top_scores() {
        let mut set = ScoredItemSet::new(3, false);
        for s in [3.0, 1.0, 4.0, 1.0, 5.0, 9.0, 2.0, 6.0] {
            set.insert(item("same", s));
        }
        assert_eq!(scores(&set), vec![9.0, 6.0, 5.0]);
    }

    #[test]
    fn test_unique_names_keep_highest_score() {
        let mut set = ScoredItemSet::new(10, true);
        assert!(set.insert(item("a", 1.0)));
        assert!(set.insert(item("a", 5.0)));
        assert!(!set.insert(item("a", 5.0)));
        assert!(!set.insert(item("a", 2.0)));
        assert_eq!(set.len(), 1);
        assert_eq!(scores(&set), vec![5.0]);
    }

    #[test]
    fn test_unknown_names_are_never_stored() {
        let mut set = ScoredItemSet::new(10, true);
        let unknown = Scored {
            name: None,
            score: 100.0,
            tag: 0,
        };
        assert!(!set.insert(unknown));
        assert!(set.is_empty());
    }

    #[test]
    fn test_full_set_rejects_equal_or_lower_scores() {
        let mut set = ScoredItemSet::new(2, true);
        set.insert(item("a", 2.0));
        set.insert(item("b", 3.0));
        assert!(!set.insert(item("c", 2.0)));
        assert!(!set.insert(item("d", 1.0)));
        assert!(set.insert(item("e", 2.5)));

        let mut names: Vec<&str> = set.iter().filter_map(|i| i.name()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["b", "e"]);
    }

    #[test]
    fn test_tie_keeps_first_inserted() {
        let mut set = ScoredItemSet::new(2, false);
        set.insert(Scored {
            tag: 1,
            ..item("x", 1.0)
        });
        set.insert(Scored {
            tag: 2,
            ..item("x", 1.0)
        });
        assert!(set.insert(Scored {
            tag: 3,
            ..item("x", 4.0)
        }));

        let tags: Vec<usize> = set.iter().map(|i| i.tag).collect();
        assert_eq!(tags, vec![1, 3]);
    }

    #[test]
    fn test_tie_after_slot_reuse_keeps_first_inserted() {
        let tagged = |tag, score| Scored {
            tag,
            ..item("x", score)
        };
        let mut set = ScoredItemSet::new(3, false);
        set.insert(tagged(1, 1.0));
        set.insert(tagged(2, 1.0));
        set.insert(tagged(3, 9.0));
        // Evicts 2, then 1; slots now hold 5, 4, 3
        assert!(set.insert(tagged(4, 3.0)));
        assert!(set.insert(tagged(5, 3.0)));

        // 4 and 5 tie for the lowest score: the later one goes
        assert!(set.insert(tagged(6, 4.0)));
        let mut tags: Vec<usize> = set.iter().map(|i| i.tag).collect();
        tags.sort_unstable();
        assert_eq!(tags, vec![3, 4, 6]);
    }
}
