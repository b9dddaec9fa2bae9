//! Bounded archive of measured records with annealing-style resampling.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

pub const DEFAULT_ARCHIVE_CAPACITY: usize = 1024;
pub const DEFAULT_TOP_K: usize = 20;

/// A record paired with its observed cost. Higher cost is better.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchEntry<R> {
    pub record: R,
    pub cost: f64,
}

impl<R> SearchEntry<R> {
    pub fn new(record: R, cost: f64) -> Self {
        Self { record, cost }
    }
}

impl<R> PartialEq for SearchEntry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.cost.total_cmp(&other.cost) == Ordering::Equal
    }
}

impl<R> Eq for SearchEntry<R> {}

impl<R> PartialOrd for SearchEntry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R> Ord for SearchEntry<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cost.total_cmp(&other.cost)
    }
}

/// Probability of accepting an entry of `cost` when the best is `best`.
pub fn acceptance(cost: f64, best: f64) -> f64 {
    ((cost - best) / (2.0 * (best.abs() + 1e-5))).exp()
}

/// Max-heap of entries keeping at most `capacity` of the best ones.
#[derive(Debug, Clone)]
pub struct SearchArchive<R> {
    heap: BinaryHeap<SearchEntry<R>>,
    capacity: usize,
}

impl<R> Default for SearchArchive<R> {
    fn default() -> Self {
        Self::new(DEFAULT_ARCHIVE_CAPACITY)
    }
}

impl<R> SearchArchive<R> {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn best(&self) -> Option<&SearchEntry<R>> {
        self.heap.peek()
    }

    pub fn push(&mut self, entry: SearchEntry<R>) {
        self.heap.push(entry);
        if self.heap.len() > self.capacity {
            let mut entries = std::mem::take(&mut self.heap).into_vec();
            if let Some(worst) = entries
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.cmp(b))
                .map(|(index, _)| index)
            {
                entries.swap_remove(worst);
            }
            self.heap = BinaryHeap::from(entries);
        }
    }

    /// The `k` best entries, best first.
    pub fn top(&self, k: usize) -> Vec<&SearchEntry<R>> {
        let mut entries: Vec<&SearchEntry<R>> = self.heap.iter().collect();
        entries.sort_unstable_by(|a, b| b.cmp(a));
        entries.truncate(k);
        entries
    }

    /// Draw an entry among the top `k`, favouring costs close to the best.
    ///
    /// Up to `k` uniform draws are made, each accepted with probability
    /// [`acceptance`]; the best entry is returned when none is accepted.
    pub fn anneal_select(&self, k: usize, rng: &mut fastrand::Rng) -> Option<&SearchEntry<R>> {
        let candidates = self.top(k);
        let best = candidates.first()?;
        let weights: Vec<f64> = candidates
            .iter()
            .map(|entry| acceptance(entry.cost, best.cost))
            .collect();
        for _ in 0..k {
            let choice = rng.usize(..candidates.len());
            if rng.f64() < weights[choice] {
                return Some(candidates[choice]);
            }
        }
        Some(best)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SearchEntry<R>> + '_ {
        self.heap.iter()
    }
}
