//! Node slab entries.
//!
//! Each node packs all of its neighbor lists into one flat `u32` buffer,
//! segmented by layer offsets computed from the connectivity parameters:
//! layer 0 sits at offset 0 with capacity `m0`, layer ℓ > 0 at
//! `m0 + (ℓ-1)·m` with capacity `m`. The tight packing keeps a node's edges
//! on few cache lines during expansion.

use parking_lot::RwLock;
use smallvec::SmallVec;

/// Dense internal id, assigned monotonically at insertion and never reused.
pub type NodeId = u32;

/// Sentinel for "no node" (the empty entry point, unused flat slots).
pub const INVALID_NODE: NodeId = u32::MAX;

/// Highest admissible `top_layer`. With the default connectivity the draw
/// lands above 8 with negligible probability; the cap bounds the flat buffer.
pub(crate) const MAX_LEVEL: usize = 16;

/// Connectivity parameters shared by every node of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkParams {
    pub m: usize,
    pub m0: usize,
}

impl LinkParams {
    /// Degree cap at `layer`.
    #[inline]
    pub fn cap(self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Offset of `layer`'s segment in the flat buffer.
    #[inline]
    pub fn offset(self, layer: usize) -> usize {
        if layer == 0 {
            0
        } else {
            self.m0 + (layer - 1) * self.m
        }
    }

    /// Flat buffer length for a node with the given top layer.
    #[inline]
    pub fn flat_len(self, top_layer: usize) -> usize {
        self.m0 + top_layer * self.m
    }
}

/// Per-layer neighbor lists of one node, packed into a single buffer.
#[derive(Debug)]
pub(crate) struct LinkLists {
    counts: SmallVec<[u16; 8]>,
    flat: Box<[NodeId]>,
}

impl LinkLists {
    pub fn new(top_layer: usize, params: LinkParams) -> Self {
        debug_assert!(top_layer <= MAX_LEVEL);
        Self {
            counts: smallvec::smallvec![0; top_layer + 1],
            flat: vec![INVALID_NODE; params.flat_len(top_layer)].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn top_layer(&self) -> usize {
        self.counts.len() - 1
    }

    #[inline]
    pub fn layer(&self, layer: usize, params: LinkParams) -> &[NodeId] {
        let at = params.offset(layer);
        &self.flat[at..at + self.counts[layer] as usize]
    }

    /// Replaces `layer`'s list. `ids` must respect the layer's degree cap.
    pub fn set_layer(&mut self, layer: usize, params: LinkParams, ids: &[NodeId]) {
        debug_assert!(ids.len() <= params.cap(layer));
        let at = params.offset(layer);
        self.flat[at..at + ids.len()].copy_from_slice(ids);
        for slot in &mut self.flat[at + ids.len()..at + params.cap(layer)] {
            *slot = INVALID_NODE;
        }
        self.counts[layer] = ids.len() as u16;
    }

    /// Appends to `layer` if there is room. Returns false when the layer is
    /// at its cap and the caller must re-select.
    pub fn push(&mut self, layer: usize, params: LinkParams, id: NodeId) -> bool {
        let len = self.counts[layer] as usize;
        if len == params.cap(layer) {
            return false;
        }
        self.flat[params.offset(layer) + len] = id;
        self.counts[layer] = (len + 1) as u16;
        true
    }

    #[inline]
    pub fn contains(&self, layer: usize, params: LinkParams, id: NodeId) -> bool {
        self.layer(layer, params).contains(&id)
    }
}

/// One slab slot. The writer lock serializes all mutation of this node's
/// lists; readers take it briefly to copy a list into worker scratch.
#[derive(Debug)]
pub(crate) struct Node {
    pub slot: RwLock<Slot>,
}

#[derive(Debug, Default)]
pub(crate) struct Slot {
    pub label: i64,
    /// `None` until the owning insertion initializes the slot.
    pub links: Option<LinkLists>,
}

impl Node {
    pub fn empty() -> Self {
        Self { slot: RwLock::new(Slot::default()) }
    }
}
