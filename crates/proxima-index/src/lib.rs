#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

//! Hierarchical navigable-small-world index.
//!
//! Layer 0 holds every node; each higher layer is an exponentially sparser
//! overlay. Insertion descends greedily from the global entry point, then
//! stitches bidirectional links layer by layer under per-node writer locks.
//! Search descends the same way and runs a bounded best-first expansion at
//! layer 0. Multiple searches and insertions proceed in parallel; exclusive
//! maintenance (`reserve`, `save`, `load`, `view`, `clear`) fails with
//! [`Error::Locked`] while traffic is in flight instead of stalling it.

mod node;
mod persist;
mod scratch;

pub use node::{NodeId, INVALID_NODE};
pub use proxima_core::{Error, IndexOptions, Kernel, Metric, MetricKind, Result, ScalarKind};

use node::{LinkLists, LinkParams, Node, MAX_LEVEL};
use parking_lot::{Mutex, RwLock};
use persist::MappedGraph;
use proxima_store::VectorStore;
use scratch::{mark_visited, Candidate, SearchContext};
use std::cmp::Reverse;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

/// Entry point and current max level packed into one word so insertion and
/// search read a consistent snapshot of both.
#[inline]
fn pack_entry(id: NodeId, level: u32) -> u64 {
    (u64::from(level) << 32) | u64::from(id)
}

#[inline]
fn entry_id(packed: u64) -> NodeId {
    packed as u32
}

#[inline]
fn entry_level(packed: u64) -> u32 {
    (packed >> 32) as u32
}

const ENTRY_EMPTY: u64 = INVALID_NODE as u64;

/// Everything replaced wholesale by `load`/`view` and grown by `reserve`.
pub(crate) struct CoreState {
    pub(crate) nodes: Vec<Node>,
    pub(crate) vectors: VectorStore,
    pub(crate) contexts: Vec<Mutex<SearchContext>>,
    pub(crate) mapped: Option<MappedGraph>,
    pub(crate) params: LinkParams,
    pub(crate) level_lambda: f64,
}

impl CoreState {
    /// Copies node `id`'s layer-ℓ list into `out`. Readers always traverse a
    /// private copy, so concurrent writers can only make the copy stale,
    /// never dangling.
    fn links_into(&self, id: NodeId, layer: usize, out: &mut Vec<NodeId>) {
        out.clear();
        if let Some(mapped) = &self.mapped {
            mapped.links_into(id, layer, out);
            return;
        }
        let slot = self.nodes[id as usize].slot.read();
        if let Some(links) = slot.links.as_ref() {
            if layer <= links.top_layer() {
                out.extend_from_slice(links.layer(layer, self.params));
            }
        }
    }

    fn top_layer(&self, id: NodeId) -> usize {
        if let Some(mapped) = &self.mapped {
            return mapped.refs[id as usize].top_layer as usize;
        }
        let slot = self.nodes[id as usize].slot.read();
        slot.links.as_ref().map_or(0, LinkLists::top_layer)
    }

    fn label(&self, id: NodeId) -> i64 {
        if let Some(mapped) = &self.mapped {
            return mapped.refs[id as usize].label;
        }
        self.nodes[id as usize].slot.read().label
    }
}

/// Aggregate counters reported by [`Index::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub size: usize,
    pub capacity: usize,
    pub max_level: usize,
    /// Directed edges summed over every node and layer.
    pub edges: usize,
}

enum VectorInput<'a> {
    Floats(&'a [f32]),
    Words(&'a [u64]),
}

/// The public façade: a navigable-small-world index over a flat vector
/// arena, safe for concurrent `add` and `search` from multiple workers.
pub struct Index {
    options: IndexOptions,
    kernel: Kernel,
    state: RwLock<CoreState>,
    size: AtomicU32,
    entry: AtomicU64,
    /// Serializes entry-point promotion; taken only when an insertion's top
    /// layer exceeds the current max level.
    promote: Mutex<()>,
    expansion_add: AtomicUsize,
    expansion_search: AtomicUsize,
}

impl Index {
    /// Builds an index with one of the built-in metrics.
    pub fn new(options: IndexOptions) -> Result<Self> {
        let metric = Metric::from_kind(options.metric)?;
        Self::with_metric(options, metric)
    }

    /// Builds an index with an explicit metric value, including
    /// [`Metric::User`] callbacks. Snapshots of user-metric indexes carry
    /// metric code 0 and only reload into another user-metric index.
    pub fn with_metric(mut options: IndexOptions, metric: Metric) -> Result<Self> {
        options.metric = metric.kind();
        options.validate()?;
        let kernel = Kernel::new(metric, options.scalar, options.dimensions)?;
        let params = LinkParams {
            m: options.connectivity,
            m0: options.connectivity_base(),
        };
        let mut vectors = VectorStore::new(kernel.payload());
        let mut nodes = Vec::new();
        if options.capacity > 0 {
            vectors.reserve(options.capacity)?;
            nodes.resize_with(options.capacity, Node::empty);
        }
        let contexts = (0..options.workers())
            .map(|worker| Mutex::new(SearchContext::new(options.seed, worker, params.m0)))
            .collect();
        let state = CoreState {
            nodes,
            vectors,
            contexts,
            mapped: None,
            params,
            level_lambda: options.level_lambda(),
        };
        Ok(Self {
            expansion_add: AtomicUsize::new(options.expansion_add),
            expansion_search: AtomicUsize::new(options.expansion_search),
            kernel,
            state: RwLock::new(state),
            size: AtomicU32::new(0),
            entry: AtomicU64::new(ENTRY_EMPTY),
            promote: Mutex::new(()),
            options,
        })
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.state.read().vectors.capacity()
    }

    #[inline]
    pub fn dimensions(&self) -> usize {
        self.options.dimensions
    }

    /// Target degree `M` at layers above zero.
    #[inline]
    pub fn connectivity(&self) -> usize {
        self.state.read().params.m
    }

    #[inline]
    pub fn scalar(&self) -> ScalarKind {
        self.options.scalar
    }

    #[inline]
    pub fn metric_kind(&self) -> MetricKind {
        self.kernel.metric().kind()
    }

    /// Current `ef_construction`.
    pub fn expansion_add(&self) -> usize {
        self.expansion_add.load(Ordering::Relaxed)
    }

    pub fn set_expansion_add(&self, ef: usize) {
        self.expansion_add.store(ef.max(1), Ordering::Relaxed);
    }

    /// Current `ef_search`; each query also floors it by its `k`.
    pub fn expansion_search(&self) -> usize {
        self.expansion_search.load(Ordering::Relaxed)
    }

    pub fn set_expansion_search(&self, ef: usize) {
        self.expansion_search.store(ef.max(1), Ordering::Relaxed);
    }

    /// Grows the slab and arena to `n` slots. Idempotent for `n` at or below
    /// the current capacity. Fails [`Error::Locked`] while `add`/`search`
    /// traffic is in flight and [`Error::Immutable`] on a mapped view.
    pub fn reserve(&self, n: usize) -> Result<()> {
        let mut state = self.state.try_write().ok_or(Error::Locked)?;
        if state.mapped.is_some() {
            return Err(Error::Immutable);
        }
        if n <= state.nodes.len() {
            return Ok(());
        }
        debug!(capacity = n, "reserving node slots");
        state.vectors.reserve(n)?;
        state.nodes.resize_with(n, Node::empty);
        Ok(())
    }

    /// Forgets every node while keeping the reserved capacity. Exclusive.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.try_write().ok_or(Error::Locked)?;
        if state.mapped.is_some() {
            return Err(Error::Immutable);
        }
        debug!("clearing index");
        for node in &mut state.nodes {
            let slot = node.slot.get_mut();
            slot.label = 0;
            slot.links = None;
        }
        self.size.store(0, Ordering::Release);
        self.entry.store(ENTRY_EMPTY, Ordering::Release);
        Ok(())
    }

    /// Inserts a vector under `label` using `worker`'s scratch. Returns the
    /// internal id. A full index fails [`Error::OutOfCapacity`] without
    /// consuming an id; growth is the caller's call via [`reserve`].
    ///
    /// [`reserve`]: Self::reserve
    pub fn add(&self, label: i64, vector: &[f32], worker: usize) -> Result<NodeId> {
        let state = self.state.read();
        self.add_impl(&state, label, VectorInput::Floats(vector), worker)
    }

    /// Word-payload insertion for the Hamming and Jaccard variants. Jaccard
    /// sets must be strictly increasing.
    pub fn add_words(&self, label: i64, words: &[u64], worker: usize) -> Result<NodeId> {
        let state = self.state.read();
        self.add_impl(&state, label, VectorInput::Words(words), worker)
    }

    /// k-nearest query. Writes up to `k` results ascending by
    /// `(distance, id)` into the caller's buffers and returns how many.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        worker: usize,
        labels: &mut [i64],
        distances: &mut [f32],
    ) -> Result<usize> {
        let state = self.state.read();
        self.search_impl(&state, VectorInput::Floats(query), k, worker, labels, distances)
    }

    /// Word-payload counterpart of [`search`](Self::search).
    pub fn search_words(
        &self,
        query: &[u64],
        k: usize,
        worker: usize,
        labels: &mut [i64],
        distances: &mut [f32],
    ) -> Result<usize> {
        let state = self.state.read();
        self.search_impl(&state, VectorInput::Words(query), k, worker, labels, distances)
    }

    /// Copy of node `id`'s layer-ℓ list (empty above its top layer).
    pub fn neighbors(&self, id: NodeId, layer: usize) -> Result<Vec<NodeId>> {
        let state = self.state.read();
        self.check_live(id)?;
        let mut out = Vec::new();
        state.links_into(id, layer, &mut out);
        Ok(out)
    }

    /// Top layer node `id` was assigned at insertion.
    pub fn top_layer(&self, id: NodeId) -> Result<usize> {
        let state = self.state.read();
        self.check_live(id)?;
        Ok(state.top_layer(id))
    }

    /// Label node `id` was inserted under.
    pub fn label_of(&self, id: NodeId) -> Result<i64> {
        let state = self.state.read();
        self.check_live(id)?;
        Ok(state.label(id))
    }

    /// Copy of node `id`'s stored vector, in the element domain's raw
    /// little-endian bytes.
    pub fn vector_bytes(&self, id: NodeId) -> Result<Vec<u8>> {
        let state = self.state.read();
        self.check_live(id)?;
        Ok(state.vectors.get(id).to_vec())
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.state.read();
        let size = self.size();
        let mut edges = 0;
        let mut buf = Vec::new();
        for id in 0..size as NodeId {
            for layer in 0..=state.top_layer(id) {
                state.links_into(id, layer, &mut buf);
                edges += buf.len();
            }
        }
        IndexStats {
            size,
            capacity: state.vectors.capacity(),
            max_level: entry_level(self.entry.load(Ordering::Acquire)) as usize,
            edges,
        }
    }

    /// Writes the whole index as one self-describing snapshot. Exclusive.
    pub fn save(&self, path: &Path) -> Result<()> {
        let state = self.state.try_write().ok_or(Error::Locked)?;
        let size = self.size.load(Ordering::Acquire);
        let entry = self.entry.load(Ordering::Acquire);
        persist::save(self, &state, size, entry, path)?;
        info!(path = %path.display(), size, "saved index snapshot");
        Ok(())
    }

    /// Replaces this index with a snapshot read fully into owned memory; the
    /// index stays mutable afterwards. Exclusive.
    pub fn load(&self, path: &Path) -> Result<()> {
        let mut state = self.state.try_write().ok_or(Error::Locked)?;
        let loaded = persist::load(path, &self.options, &self.kernel)?;
        self.install(&mut state, loaded);
        info!(path = %path.display(), size = self.size(), "loaded index snapshot");
        Ok(())
    }

    /// Replaces this index with a read-only view served straight from a
    /// memory mapping; mutation fails [`Error::Immutable`]. Exclusive.
    pub fn view(&self, path: &Path) -> Result<()> {
        let mut state = self.state.try_write().ok_or(Error::Locked)?;
        let loaded = persist::view(path, &self.options, &self.kernel)?;
        self.install(&mut state, loaded);
        info!(path = %path.display(), size = self.size(), "mapped index snapshot");
        Ok(())
    }

    fn install(&self, state: &mut CoreState, loaded: persist::Loaded) {
        state.nodes = loaded.nodes;
        state.vectors = loaded.vectors;
        state.mapped = loaded.mapped;
        state.params = loaded.params;
        state.level_lambda = loaded.level_lambda;
        state.contexts = (0..self.options.workers())
            .map(|worker| {
                Mutex::new(SearchContext::new(self.options.seed, worker, loaded.params.m0))
            })
            .collect();
        self.expansion_add
            .store(loaded.expansion_add as usize, Ordering::Relaxed);
        self.expansion_search
            .store(loaded.expansion_search as usize, Ordering::Relaxed);
        self.size.store(loaded.size, Ordering::Release);
        let entry = if loaded.size == 0 {
            ENTRY_EMPTY
        } else {
            pack_entry(loaded.entry, loaded.max_level)
        };
        self.entry.store(entry, Ordering::Release);
    }

    fn check_live(&self, id: NodeId) -> Result<()> {
        let size = self.size();
        if (id as usize) < size {
            Ok(())
        } else {
            Err(Error::InvalidArgument(format!(
                "node {id} is not live (size {size})"
            )))
        }
    }

    fn add_impl(
        &self,
        state: &CoreState,
        label: i64,
        input: VectorInput<'_>,
        worker: usize,
    ) -> Result<NodeId> {
        if state.mapped.is_some() {
            return Err(Error::Immutable);
        }
        let params = state.params;
        let mut ctx = self.lock_context(state, worker)?;
        self.encode(&mut ctx, &input)?;

        let top_layer = ctx.random_level(state.level_lambda, MAX_LEVEL);

        // The id is reserved last, after validation and the layer draw, so a
        // failed add never consumes one.
        let capacity = state.vectors.capacity();
        let id = self
            .size
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                if (s as usize) < capacity {
                    Some(s + 1)
                } else {
                    None
                }
            })
            .map_err(|s| Error::OutOfCapacity {
                size: s as usize,
                capacity,
            })?;

        state.vectors.write(id, &ctx.query)?;
        {
            let mut slot = state.nodes[id as usize].slot.write();
            slot.label = label;
            slot.links = Some(LinkLists::new(top_layer, params));
        }

        let mut snap = self.entry.load(Ordering::Acquire);
        if entry_id(snap) == INVALID_NODE {
            let _guard = self.promote.lock();
            snap = self.entry.load(Ordering::Acquire);
            if entry_id(snap) == INVALID_NODE {
                self.entry
                    .store(pack_entry(id, top_layer as u32), Ordering::Release);
                return Ok(id);
            }
        }

        let max_level = entry_level(snap) as usize;
        let mut cur = entry_id(snap);
        let cur_dist = self
            .kernel
            .distance(&ctx.query, state.vectors.get(cur));

        if max_level > top_layer {
            let parts = ctx.split();
            (cur, _) = greedy_descent(
                state,
                &self.kernel,
                parts.query,
                parts.neighbors,
                cur,
                cur_dist,
                max_level,
                top_layer + 1,
            );
        }

        let ef = self.expansion_add.load(Ordering::Relaxed);
        let mut pool: Vec<Candidate> = Vec::new();
        let mut selected: Vec<NodeId> = Vec::with_capacity(params.m0);
        let mut prune_pool: Vec<Candidate> = Vec::with_capacity(params.m0 + 1);
        let mut prune_keep: Vec<NodeId> = Vec::with_capacity(params.m0);

        for layer in (0..=top_layer.min(max_level)).rev() {
            search_layer(state, &self.kernel, &mut ctx, cur, layer, ef, capacity);
            pool.clear();
            pool.extend(ctx.results.iter().copied());
            pool.sort_unstable();
            pool.retain(|c| c.id != id);
            if pool.is_empty() {
                continue;
            }

            select_diverse(state, &self.kernel, &pool, params.cap(layer), &mut selected);
            {
                let mut slot = state.nodes[id as usize].slot.write();
                if let Some(links) = slot.links.as_mut() {
                    links.set_layer(layer, params, &selected);
                }
            }

            for &peer in &selected {
                self.back_link(state, peer, id, layer, &mut prune_pool, &mut prune_keep);
            }

            cur = pool[0].id;
        }

        if top_layer > max_level {
            let _guard = self.promote.lock();
            let current = self.entry.load(Ordering::Acquire);
            if top_layer as u32 > entry_level(current) {
                self.entry
                    .store(pack_entry(id, top_layer as u32), Ordering::Release);
            }
        }

        Ok(id)
    }

    /// Appends `id` to `peer`'s layer-ℓ list; on overflow re-runs the
    /// diversified rule over the old list plus `id` with distances measured
    /// against `peer`, all under `peer`'s writer lock.
    fn back_link(
        &self,
        state: &CoreState,
        peer: NodeId,
        id: NodeId,
        layer: usize,
        pool: &mut Vec<Candidate>,
        keep: &mut Vec<NodeId>,
    ) {
        let params = state.params;
        let mut slot = state.nodes[peer as usize].slot.write();
        let Some(links) = slot.links.as_mut() else {
            return;
        };
        if links.top_layer() < layer || links.contains(layer, params, id) {
            return;
        }
        if links.push(layer, params, id) {
            return;
        }
        let peer_vector = state.vectors.get(peer);
        pool.clear();
        for &existing in links.layer(layer, params) {
            pool.push(Candidate {
                distance: self
                    .kernel
                    .distance(peer_vector, state.vectors.get(existing)),
                id: existing,
            });
        }
        pool.push(Candidate {
            distance: self.kernel.distance(peer_vector, state.vectors.get(id)),
            id,
        });
        pool.sort_unstable();
        select_diverse(state, &self.kernel, pool, params.cap(layer), keep);
        links.set_layer(layer, params, keep);
    }

    fn search_impl(
        &self,
        state: &CoreState,
        input: VectorInput<'_>,
        k: usize,
        worker: usize,
        labels: &mut [i64],
        distances: &mut [f32],
    ) -> Result<usize> {
        if labels.len() < k || distances.len() < k {
            return Err(Error::InvalidArgument(format!(
                "result buffers hold {} labels / {} distances, need {k}",
                labels.len(),
                distances.len()
            )));
        }
        let mut ctx = self.lock_context(state, worker)?;
        self.encode(&mut ctx, &input)?;
        if k == 0 {
            return Ok(0);
        }

        let snap = self.entry.load(Ordering::Acquire);
        if entry_id(snap) == INVALID_NODE {
            return Ok(0);
        }
        let max_level = entry_level(snap) as usize;
        let mut cur = entry_id(snap);
        let cur_dist = self
            .kernel
            .distance(&ctx.query, state.vectors.get(cur));

        if max_level > 0 {
            let parts = ctx.split();
            (cur, _) = greedy_descent(
                state,
                &self.kernel,
                parts.query,
                parts.neighbors,
                cur,
                cur_dist,
                max_level,
                1,
            );
        }

        let ef = self.expansion_search.load(Ordering::Relaxed).max(k);
        let capacity = state.vectors.capacity();
        search_layer(state, &self.kernel, &mut ctx, cur, 0, ef, capacity);

        let mut pool: Vec<Candidate> = ctx.results.iter().copied().collect();
        pool.sort_unstable();
        let found = pool.len().min(k);
        for (i, candidate) in pool.iter().take(found).enumerate() {
            labels[i] = state.label(candidate.id);
            distances[i] = candidate.distance;
        }
        Ok(found)
    }

    fn lock_context<'a>(
        &self,
        state: &'a CoreState,
        worker: usize,
    ) -> Result<parking_lot::MutexGuard<'a, SearchContext>> {
        state
            .contexts
            .get(worker)
            .map(Mutex::lock)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "worker {worker} out of range ({} scratch slots)",
                    state.contexts.len()
                ))
            })
    }

    fn encode(&self, ctx: &mut SearchContext, input: &VectorInput<'_>) -> Result<()> {
        let mut query = std::mem::take(&mut ctx.query);
        let outcome = match input {
            VectorInput::Floats(v) => self.kernel.encode_f32(v, &mut query),
            VectorInput::Words(w) => self.kernel.encode_words(w, &mut query),
        };
        ctx.query = query;
        outcome
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("dimensions", &self.options.dimensions)
            .field("metric", &self.kernel.metric())
            .field("scalar", &self.options.scalar)
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Greedy walk: at each layer from `top` down to `bottom`, repeatedly hop to
/// the closest neighbor until none improves on the current node.
#[allow(clippy::too_many_arguments)]
fn greedy_descent(
    state: &CoreState,
    kernel: &Kernel,
    query: &[u8],
    neighbors: &mut Vec<NodeId>,
    mut cur: NodeId,
    mut cur_dist: f32,
    top: usize,
    bottom: usize,
) -> (NodeId, f32) {
    for layer in (bottom..=top).rev() {
        let mut changed = true;
        while changed {
            changed = false;
            state.links_into(cur, layer, neighbors);
            for index in 0..neighbors.len() {
                let next = neighbors[index];
                let d = kernel.distance(query, state.vectors.get(next));
                if d < cur_dist || (d == cur_dist && next < cur) {
                    cur_dist = d;
                    cur = next;
                    changed = true;
                }
            }
        }
    }
    (cur, cur_dist)
}

/// Best-first expansion at one layer. Leaves the best `ef` candidates in
/// `ctx.results`, ordered as a max-heap on `(distance, id)`.
fn search_layer(
    state: &CoreState,
    kernel: &Kernel,
    ctx: &mut SearchContext,
    start: NodeId,
    layer: usize,
    ef: usize,
    capacity: usize,
) {
    let stamp = ctx.begin(capacity);
    let parts = ctx.split();

    let seed = Candidate {
        distance: kernel.distance(parts.query, state.vectors.get(start)),
        id: start,
    };
    parts.candidates.push(Reverse(seed));
    parts.results.push(seed);
    mark_visited(parts.visited, stamp, start);

    while let Some(Reverse(current)) = parts.candidates.pop() {
        let worst = parts
            .results
            .peek()
            .map_or(f32::INFINITY, |c| c.distance);
        if parts.results.len() >= ef && current.distance > worst {
            break;
        }

        state.links_into(current.id, layer, parts.neighbors);
        for index in 0..parts.neighbors.len() {
            let next = parts.neighbors[index];
            if !mark_visited(parts.visited, stamp, next) {
                continue;
            }
            let candidate = Candidate {
                distance: kernel.distance(parts.query, state.vectors.get(next)),
                id: next,
            };
            let admit = match parts.results.peek() {
                Some(worst) => parts.results.len() < ef || candidate < *worst,
                None => true,
            };
            if admit {
                parts.candidates.push(Reverse(candidate));
                parts.results.push(candidate);
                if parts.results.len() > ef {
                    parts.results.pop();
                }
            }
        }
    }
}

/// The diversified-neighbor rule: walking candidates ascending by distance to
/// the target, keep one iff the target is strictly closer to it than every
/// already-kept neighbor is. Stops once `cap` are kept.
fn select_diverse(
    state: &CoreState,
    kernel: &Kernel,
    pool: &[Candidate],
    cap: usize,
    keep: &mut Vec<NodeId>,
) {
    keep.clear();
    for candidate in pool {
        if keep.len() == cap {
            break;
        }
        let vector = state.vectors.get(candidate.id);
        let diverse = keep.iter().all(|&kept| {
            kernel.distance(vector, state.vectors.get(kept)) > candidate.distance
        });
        if diverse {
            keep.push(candidate.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l2_index(dims: usize, capacity: usize) -> Index {
        let mut options = IndexOptions::new(dims);
        options.metric = MetricKind::L2sq;
        options.capacity = capacity;
        options.max_workers = 1;
        Index::new(options).unwrap()
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = l2_index(3, 4);
        let mut labels = [0i64; 2];
        let mut distances = [0f32; 2];
        let found = index
            .search(&[1.0, 0.0, 0.0], 2, 0, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(found, 0);
        assert_eq!(index.size(), 0);
    }

    #[test]
    fn single_vector_is_its_own_nearest() {
        let index = l2_index(3, 4);
        index.add(7, &[1.0, 0.0, 0.0], 0).unwrap();

        let mut labels = [0i64; 1];
        let mut distances = [0f32; 1];
        let found = index
            .search(&[1.0, 0.0, 0.0], 1, 0, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(found, 1);
        assert_eq!(labels[0], 7);
        assert_eq!(distances[0], 0.0);
    }

    #[test]
    fn out_of_capacity_does_not_consume_ids() {
        let index = l2_index(2, 2);
        index.add(1, &[0.0, 0.0], 0).unwrap();
        index.add(2, &[1.0, 0.0], 0).unwrap();
        let err = index.add(3, &[0.0, 1.0], 0).unwrap_err();
        assert!(matches!(err, Error::OutOfCapacity { .. }));
        assert_eq!(index.size(), 2);

        index.reserve(4).unwrap();
        let id = index.add(3, &[0.0, 1.0], 0).unwrap();
        assert_eq!(id, 2);
    }

    #[test]
    fn wrong_dimensionality_is_rejected_before_any_state_change() {
        let index = l2_index(3, 4);
        assert!(matches!(
            index.add(1, &[1.0, 0.0], 0),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(index.size(), 0);
    }

    #[test]
    fn bad_worker_id_is_rejected() {
        let index = l2_index(2, 4);
        assert!(matches!(
            index.add(1, &[0.0, 0.0], 99),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn duplicate_labels_both_surface() {
        let index = l2_index(2, 4);
        index.add(5, &[0.0, 0.0], 0).unwrap();
        index.add(5, &[1.0, 1.0], 0).unwrap();

        let mut labels = [0i64; 2];
        let mut distances = [0f32; 2];
        let found = index
            .search(&[0.0, 0.0], 2, 0, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(found, 2);
        assert_eq!(labels, [5, 5]);
        assert_eq!(distances, [0.0, 2.0]);
    }

    #[test]
    fn equal_distances_break_toward_lower_id() {
        let mut options = IndexOptions::new(2);
        options.metric = MetricKind::Ip;
        options.capacity = 4;
        options.max_workers = 1;
        let index = Index::new(options).unwrap();
        index.add(1, &[1.0, 0.0], 0).unwrap();
        index.add(2, &[1.0, 0.0], 0).unwrap();

        let mut labels = [0i64; 2];
        let mut distances = [0f32; 2];
        let found = index
            .search(&[1.0, 0.0], 2, 0, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(found, 2);
        assert_eq!(distances, [0.0, 0.0]);
        assert_eq!(labels, [1, 2]);
    }

    #[test]
    fn hamming_variant_searches_word_payloads() {
        let mut options = IndexOptions::new(2);
        options.metric = MetricKind::Hamming;
        options.scalar = ScalarKind::U64;
        options.capacity = 4;
        options.max_workers = 1;
        let index = Index::new(options).unwrap();
        index.add_words(10, &[0b0000, 0], 0).unwrap();
        index.add_words(11, &[0b0111, 0], 0).unwrap();

        let mut labels = [0i64; 2];
        let mut distances = [0f32; 2];
        let found = index
            .search_words(&[0b0001, 0], 2, 0, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(found, 2);
        assert_eq!(labels, [10, 11]);
        assert_eq!(distances, [1.0, 2.0]);
    }

    #[test]
    fn float_input_on_word_index_is_rejected() {
        let mut options = IndexOptions::new(2);
        options.metric = MetricKind::Hamming;
        options.scalar = ScalarKind::U64;
        options.capacity = 2;
        options.max_workers = 1;
        let index = Index::new(options).unwrap();
        assert!(matches!(
            index.add(1, &[0.5, 0.5], 0),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn clear_keeps_capacity() {
        let index = l2_index(2, 8);
        for i in 0..5 {
            index.add(i, &[i as f32, 0.0], 0).unwrap();
        }
        index.clear().unwrap();
        assert_eq!(index.size(), 0);
        assert_eq!(index.capacity(), 8);

        let mut labels = [0i64; 1];
        let mut distances = [0f32; 1];
        assert_eq!(
            index
                .search(&[0.0, 0.0], 1, 0, &mut labels, &mut distances)
                .unwrap(),
            0
        );

        index.add(42, &[1.0, 2.0], 0).unwrap();
        assert_eq!(index.size(), 1);
        assert_eq!(index.label_of(0).unwrap(), 42);
    }

    #[test]
    fn user_metric_drives_ordering() {
        let metric = Metric::User(std::sync::Arc::new(|a: &[u8], b: &[u8], _dims| {
            // Absolute difference of the first byte: a toy but valid metric.
            (f32::from(a[0]) - f32::from(b[0])).abs()
        }));
        let mut options = IndexOptions::new(4);
        options.capacity = 4;
        options.max_workers = 1;
        options.scalar = ScalarKind::I8;
        let index = Index::with_metric(options, metric).unwrap();
        assert_eq!(index.metric_kind(), MetricKind::User);
        index.add(1, &[0.1, 0.0, 0.0, 0.0], 0).unwrap();
        index.add(2, &[0.9, 0.0, 0.0, 0.0], 0).unwrap();

        let mut labels = [0i64; 1];
        let mut distances = [0f32; 1];
        let found = index
            .search(&[0.88, 0.0, 0.0, 0.0], 1, 0, &mut labels, &mut distances)
            .unwrap();
        assert_eq!(found, 1);
        assert_eq!(labels[0], 2);
    }
}
