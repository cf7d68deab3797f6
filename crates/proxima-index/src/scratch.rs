//! Per-worker search scratch.
//!
//! Scratch is keyed by a caller-supplied worker id so the engine stays
//! agnostic to the thread pool; worker ids must be unique among in-flight
//! operations. The visited map uses a generation stamp per search instead of
//! zeroing `capacity` bits every time; a full zero happens only when the
//! stamp wraps.

use crate::node::NodeId;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A node paired with its distance to the current query. Ordering is
/// lexicographic on `(distance, id)` so equal distances break toward the
/// lower internal id everywhere: heap eviction, extraction and result order
/// all agree.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub distance: f32,
    pub id: NodeId,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct SearchContext {
    visited: Vec<u32>,
    generation: u32,
    /// Min-heap on `(distance, id)`: the expansion frontier.
    pub candidates: BinaryHeap<Reverse<Candidate>>,
    /// Max-heap on `(distance, id)`: the best `ef` found so far.
    pub results: BinaryHeap<Candidate>,
    /// Copy buffer for one neighbor list; sized for layer 0 plus the slot a
    /// back-link overflow temporarily needs.
    pub neighbors: Vec<NodeId>,
    /// Query converted into the index's element domain.
    pub query: Vec<u8>,
    pub rng: SmallRng,
}

impl SearchContext {
    pub fn new(seed: u64, worker: usize, m0: usize) -> Self {
        Self {
            visited: Vec::new(),
            generation: 0,
            candidates: BinaryHeap::new(),
            results: BinaryHeap::new(),
            neighbors: Vec::with_capacity(m0 + 1),
            query: Vec::new(),
            rng: SmallRng::seed_from_u64(
                seed ^ (worker as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            ),
        }
    }

    /// Starts a fresh traversal: bumps the visited stamp and clears the heaps
    /// while keeping their allocations.
    pub fn begin(&mut self, capacity: usize) -> u32 {
        if self.visited.len() < capacity {
            self.visited.resize(capacity, 0);
        }
        self.generation = self.generation.wrapping_add(1);
        if self.generation == 0 {
            self.visited.fill(0);
            self.generation = 1;
        }
        self.candidates.clear();
        self.results.clear();
        self.generation
    }

    /// Random top layer: `⌊-ln(r)·lambda⌋` with `r` uniform in `(0, 1]`.
    pub fn random_level(&mut self, lambda: f64, max_level: usize) -> usize {
        let r: f64 = 1.0 - self.rng.gen::<f64>();
        let level = (-r.ln() * lambda) as usize;
        level.min(max_level)
    }

    #[inline]
    pub fn split(&mut self) -> ScratchParts<'_> {
        ScratchParts {
            visited: &mut self.visited,
            candidates: &mut self.candidates,
            results: &mut self.results,
            neighbors: &mut self.neighbors,
            query: &self.query,
        }
    }
}

/// Marks `id` visited under `stamp`; returns false if it already was.
#[inline]
pub(crate) fn mark_visited(marks: &mut [u32], stamp: u32, id: NodeId) -> bool {
    let slot = &mut marks[id as usize];
    if *slot == stamp {
        false
    } else {
        *slot = stamp;
        true
    }
}

/// Disjoint borrows of the scratch fields used inside one traversal.
pub(crate) struct ScratchParts<'a> {
    pub visited: &'a mut Vec<u32>,
    pub candidates: &'a mut BinaryHeap<Reverse<Candidate>>,
    pub results: &'a mut BinaryHeap<Candidate>,
    pub neighbors: &'a mut Vec<NodeId>,
    pub query: &'a [u8],
}
