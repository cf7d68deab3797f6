//! Construction-time options for an index.

use crate::{Error, MetricKind, Result, ScalarKind};
use serde::{Deserialize, Serialize};

/// Default seed for the per-worker level RNGs. Fixing it keeps
/// single-threaded builds reproducible.
pub const DEFAULT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Options recognized at construction. Only `dimensions` has no usable
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexOptions {
    /// Vector length `D`. All vectors in one index share it.
    pub dimensions: usize,
    /// Node slots reserved up front. Growth afterwards goes through
    /// `reserve`.
    pub capacity: usize,
    /// Element kind of stored vectors.
    pub scalar: ScalarKind,
    /// Built-in metric tag. A user callback is supplied through the
    /// dedicated constructor instead.
    pub metric: MetricKind,
    /// Target degree `M` at layers above zero; layer zero holds `2·M`.
    pub connectivity: usize,
    /// Beam width during insertion (`ef_construction`).
    pub expansion_add: usize,
    /// Beam width during queries (`ef_search`), floored by `k` per call.
    pub expansion_search: usize,
    /// Scratch pool size; worker ids passed to `add`/`search` must be below
    /// it. Zero means "detect hardware parallelism".
    pub max_workers: usize,
    /// Seed for the per-worker level RNGs.
    pub seed: u64,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            dimensions: 0,
            capacity: 0,
            scalar: ScalarKind::F32,
            metric: MetricKind::Ip,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            max_workers: 0,
            seed: DEFAULT_SEED,
        }
    }
}

impl IndexOptions {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimensions == 0 {
            return Err(Error::InvalidArgument("dimensions must be non-zero".into()));
        }
        if self.connectivity < 2 {
            return Err(Error::InvalidArgument(
                "connectivity must be at least 2".into(),
            ));
        }
        if self.expansion_add == 0 || self.expansion_search == 0 {
            return Err(Error::InvalidArgument(
                "expansion factors must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Degree cap at layer zero.
    #[inline]
    pub fn connectivity_base(&self) -> usize {
        self.connectivity * 2
    }

    /// Decay parameter for the random layer draw: `1 / ln(M)`.
    #[inline]
    pub fn level_lambda(&self) -> f64 {
        1.0 / (self.connectivity as f64).ln()
    }

    /// Resolved scratch pool size.
    pub fn workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers;
        }
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}
