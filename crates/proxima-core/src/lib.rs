#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod metric;

pub use config::IndexOptions;
pub use metric::{Kernel, Metric, UserDistance};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for all proxima operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine. Nothing is swallowed or retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Wrong dimensionality, malformed payload, bad worker id, or an
    /// unsupported metric/scalar combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `add` was called with every reserved slot in use. Growth is the
    /// caller's responsibility via `reserve`.
    #[error("index is full ({size} of {capacity} slots in use)")]
    OutOfCapacity { size: usize, capacity: usize },

    /// Underlying file error during `save`/`load`/`view`.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot magic, version, geometry or metric does not match this index.
    #[error("incompatible file: {0}")]
    IncompatibleFile(String),

    /// An exclusive operation was attempted while `add`/`search` traffic is
    /// in flight.
    #[error("exclusive operation attempted during concurrent traffic")]
    Locked,

    /// Mutation of an index served from a read-only mapping.
    #[error("index is backed by a read-only mapping")]
    Immutable,
}

/// Width and interpretation of one vector element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarKind {
    F16,
    F32,
    F64,
    I8,
    /// 64-bit words: bit-hash payloads for Hamming, sorted id sets for
    /// Jaccard.
    U64,
}

impl ScalarKind {
    /// Size of one element in bytes.
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            ScalarKind::I8 => 1,
            ScalarKind::F16 => 2,
            ScalarKind::F32 => 4,
            ScalarKind::F64 | ScalarKind::U64 => 8,
        }
    }

    /// Stable on-disk code. Part of the snapshot contract.
    pub const fn code(self) -> u32 {
        match self {
            ScalarKind::F16 => 1,
            ScalarKind::F32 => 2,
            ScalarKind::F64 => 3,
            ScalarKind::I8 => 4,
            ScalarKind::U64 => 5,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ScalarKind::F16),
            2 => Some(ScalarKind::F32),
            3 => Some(ScalarKind::F64),
            4 => Some(ScalarKind::I8),
            5 => Some(ScalarKind::U64),
            _ => None,
        }
    }
}

/// Tag for the built-in distance functions plus the user-callback escape
/// hatch. Lower distance always means closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Ip,
    Cos,
    L2sq,
    Hamming,
    Jaccard,
    User,
}

impl MetricKind {
    /// Stable on-disk code. Files written with a user callback carry code 0
    /// and are not portable across processes.
    pub const fn code(self) -> u32 {
        match self {
            MetricKind::User => 0,
            MetricKind::Ip => 1,
            MetricKind::Cos => 2,
            MetricKind::L2sq => 3,
            MetricKind::Hamming => 4,
            MetricKind::Jaccard => 5,
        }
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(MetricKind::User),
            1 => Some(MetricKind::Ip),
            2 => Some(MetricKind::Cos),
            3 => Some(MetricKind::L2sq),
            4 => Some(MetricKind::Hamming),
            5 => Some(MetricKind::Jaccard),
            _ => None,
        }
    }

    /// Whether this metric runs over `u64` word payloads rather than scalar
    /// vectors.
    pub const fn is_word_metric(self) -> bool {
        matches!(self, MetricKind::Hamming | MetricKind::Jaccard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_codes_roundtrip() {
        for kind in [
            ScalarKind::F16,
            ScalarKind::F32,
            ScalarKind::F64,
            ScalarKind::I8,
            ScalarKind::U64,
        ] {
            assert_eq!(ScalarKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ScalarKind::from_code(99), None);
    }

    #[test]
    fn metric_codes_roundtrip() {
        for kind in [
            MetricKind::User,
            MetricKind::Ip,
            MetricKind::Cos,
            MetricKind::L2sq,
            MetricKind::Hamming,
            MetricKind::Jaccard,
        ] {
            assert_eq!(MetricKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(MetricKind::from_code(6), None);
    }

    #[test]
    fn user_metric_is_code_zero() {
        assert_eq!(MetricKind::User.code(), 0);
    }
}
