//! Distance kernels and their dispatch.
//!
//! A [`Kernel`] binds a metric, an element kind and a dimension count and
//! computes distances over raw little-endian byte views of two vectors.
//! Kernels are pure and deterministic; lower result means closer. For the
//! inner-product family the stored distance is `1 - dot` / `1 - cos` so the
//! "smaller is better" convention holds everywhere.

use crate::{Error, MetricKind, Result, ScalarKind};
use half::f16;
use std::fmt;
use std::sync::Arc;

/// Caller-provided distance over raw vector views and the shared dimension.
pub type UserDistance = Arc<dyn Fn(&[u8], &[u8], usize) -> f32 + Send + Sync>;

/// A distance function value: one of the built-ins or a user callback.
#[derive(Clone)]
pub enum Metric {
    Ip,
    Cos,
    L2sq,
    Hamming,
    Jaccard,
    User(UserDistance),
}

impl Metric {
    pub fn kind(&self) -> MetricKind {
        match self {
            Metric::Ip => MetricKind::Ip,
            Metric::Cos => MetricKind::Cos,
            Metric::L2sq => MetricKind::L2sq,
            Metric::Hamming => MetricKind::Hamming,
            Metric::Jaccard => MetricKind::Jaccard,
            Metric::User(_) => MetricKind::User,
        }
    }

    /// Resolves a built-in by tag. `User` has no default callback and must be
    /// constructed explicitly.
    pub fn from_kind(kind: MetricKind) -> Result<Self> {
        match kind {
            MetricKind::Ip => Ok(Metric::Ip),
            MetricKind::Cos => Ok(Metric::Cos),
            MetricKind::L2sq => Ok(Metric::L2sq),
            MetricKind::Hamming => Ok(Metric::Hamming),
            MetricKind::Jaccard => Ok(Metric::Jaccard),
            MetricKind::User => Err(Error::InvalidArgument(
                "a user metric requires an explicit callback".into(),
            )),
        }
    }
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::User(_) => f.write_str("User(..)"),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

/// Distance dispatcher bound to `(metric, scalar, dims)`.
#[derive(Debug, Clone)]
pub struct Kernel {
    metric: Metric,
    scalar: ScalarKind,
    dims: usize,
}

impl Kernel {
    pub fn new(metric: Metric, scalar: ScalarKind, dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(Error::InvalidArgument("dimensions must be non-zero".into()));
        }
        let kind = metric.kind();
        if kind.is_word_metric() && scalar != ScalarKind::U64 {
            return Err(Error::InvalidArgument(format!(
                "{kind:?} runs over u64 words, not {scalar:?}"
            )));
        }
        if !kind.is_word_metric() && kind != MetricKind::User && scalar == ScalarKind::U64 {
            return Err(Error::InvalidArgument(format!(
                "{kind:?} is undefined over u64 words"
            )));
        }
        Ok(Self { metric, scalar, dims })
    }

    #[inline]
    pub fn dims(&self) -> usize {
        self.dims
    }

    #[inline]
    pub fn scalar(&self) -> ScalarKind {
        self.scalar
    }

    #[inline]
    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    /// Bytes of one vector payload, excluding any arena padding.
    #[inline]
    pub fn payload(&self) -> usize {
        self.dims * self.scalar.size()
    }

    /// Distance between two same-kind vector views.
    #[inline]
    pub fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
        debug_assert_eq!(a.len(), self.payload());
        debug_assert_eq!(b.len(), self.payload());
        match &self.metric {
            Metric::Ip => 1.0 - dot(a, b, self.scalar),
            Metric::Cos => cosine_distance(a, b, self.scalar),
            Metric::L2sq => l2sq(a, b, self.scalar),
            Metric::Hamming => hamming(a, b),
            Metric::Jaccard => jaccard(a, b),
            Metric::User(f) => f(a, b, self.dims),
        }
    }

    /// Converts an `f32` vector into this kernel's element domain, replacing
    /// the contents of `dst`.
    pub fn encode_f32(&self, src: &[f32], dst: &mut Vec<u8>) -> Result<()> {
        if src.len() != self.dims {
            return Err(Error::InvalidArgument(format!(
                "vector has {} dimensions, index expects {}",
                src.len(),
                self.dims
            )));
        }
        dst.clear();
        dst.reserve(self.payload());
        match self.scalar {
            ScalarKind::F32 => {
                for &x in src {
                    dst.extend_from_slice(&x.to_le_bytes());
                }
            }
            ScalarKind::F64 => {
                for &x in src {
                    dst.extend_from_slice(&f64::from(x).to_le_bytes());
                }
            }
            ScalarKind::F16 => {
                for &x in src {
                    dst.extend_from_slice(&f16::from_f32(x).to_le_bytes());
                }
            }
            ScalarKind::I8 => {
                // Same quantization rule the pack uses for i8 storage.
                for &x in src {
                    dst.push((x * 127.0).clamp(-127.0, 127.0) as i8 as u8);
                }
            }
            ScalarKind::U64 => {
                return Err(Error::InvalidArgument(
                    "word-payload index expects u64 input, not f32".into(),
                ))
            }
        }
        Ok(())
    }

    /// Converts a `u64` word payload (Hamming hashes or a Jaccard sorted id
    /// set) into `dst`, validating set order for Jaccard.
    pub fn encode_words(&self, src: &[u64], dst: &mut Vec<u8>) -> Result<()> {
        if self.scalar != ScalarKind::U64 {
            return Err(Error::InvalidArgument(format!(
                "{:?} index expects f32 input, not u64 words",
                self.scalar
            )));
        }
        if src.len() != self.dims {
            return Err(Error::InvalidArgument(format!(
                "payload has {} words, index expects {}",
                src.len(),
                self.dims
            )));
        }
        if self.metric.kind() == MetricKind::Jaccard && !src.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::InvalidArgument(
                "jaccard set must be strictly increasing".into(),
            ));
        }
        dst.clear();
        dst.reserve(self.payload());
        for &w in src {
            dst.extend_from_slice(&w.to_le_bytes());
        }
        Ok(())
    }
}

#[inline]
fn read_f32(c: &[u8]) -> f32 {
    f32::from_le_bytes([c[0], c[1], c[2], c[3]])
}

#[inline]
fn read_f64(c: &[u8]) -> f64 {
    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
}

#[inline]
fn read_f16(c: &[u8]) -> f32 {
    f16::from_le_bytes([c[0], c[1]]).to_f32()
}

#[inline]
fn read_u64(c: &[u8]) -> u64 {
    u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
}

fn dot(a: &[u8], b: &[u8], scalar: ScalarKind) -> f32 {
    match scalar {
        ScalarKind::F32 => a
            .chunks_exact(4)
            .zip(b.chunks_exact(4))
            .map(|(x, y)| read_f32(x) * read_f32(y))
            .sum(),
        ScalarKind::F64 => a
            .chunks_exact(8)
            .zip(b.chunks_exact(8))
            .map(|(x, y)| read_f64(x) * read_f64(y))
            .sum::<f64>() as f32,
        ScalarKind::F16 => a
            .chunks_exact(2)
            .zip(b.chunks_exact(2))
            .map(|(x, y)| read_f16(x) * read_f16(y))
            .sum(),
        ScalarKind::I8 => {
            let acc: i32 = a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| i32::from(x as i8) * i32::from(y as i8))
                .sum();
            // Back into the float domain the values were quantized from.
            acc as f32 / (127.0 * 127.0)
        }
        ScalarKind::U64 => unreachable!("word metrics never reach the dot kernel"),
    }
}

fn l2sq(a: &[u8], b: &[u8], scalar: ScalarKind) -> f32 {
    match scalar {
        ScalarKind::F32 => a
            .chunks_exact(4)
            .zip(b.chunks_exact(4))
            .map(|(x, y)| {
                let d = read_f32(x) - read_f32(y);
                d * d
            })
            .sum(),
        ScalarKind::F64 => a
            .chunks_exact(8)
            .zip(b.chunks_exact(8))
            .map(|(x, y)| {
                let d = read_f64(x) - read_f64(y);
                d * d
            })
            .sum::<f64>() as f32,
        ScalarKind::F16 => a
            .chunks_exact(2)
            .zip(b.chunks_exact(2))
            .map(|(x, y)| {
                let d = read_f16(x) - read_f16(y);
                d * d
            })
            .sum(),
        ScalarKind::I8 => {
            let acc: i32 = a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| {
                    let d = i32::from(x as i8) - i32::from(y as i8);
                    d * d
                })
                .sum();
            acc as f32 / (127.0 * 127.0)
        }
        ScalarKind::U64 => unreachable!("word metrics never reach the l2 kernel"),
    }
}

fn cosine_distance(a: &[u8], b: &[u8], scalar: ScalarKind) -> f32 {
    let (dot, norm_a, norm_b) = match scalar {
        ScalarKind::F32 => a.chunks_exact(4).zip(b.chunks_exact(4)).fold(
            (0.0f32, 0.0f32, 0.0f32),
            |(d, na, nb), (x, y)| {
                let (x, y) = (read_f32(x), read_f32(y));
                (d + x * y, na + x * x, nb + y * y)
            },
        ),
        ScalarKind::F64 => {
            let (d, na, nb) = a.chunks_exact(8).zip(b.chunks_exact(8)).fold(
                (0.0f64, 0.0f64, 0.0f64),
                |(d, na, nb), (x, y)| {
                    let (x, y) = (read_f64(x), read_f64(y));
                    (d + x * y, na + x * x, nb + y * y)
                },
            );
            (d as f32, na as f32, nb as f32)
        }
        ScalarKind::F16 => a.chunks_exact(2).zip(b.chunks_exact(2)).fold(
            (0.0f32, 0.0f32, 0.0f32),
            |(d, na, nb), (x, y)| {
                let (x, y) = (read_f16(x), read_f16(y));
                (d + x * y, na + x * x, nb + y * y)
            },
        ),
        ScalarKind::I8 => {
            let (d, na, nb) =
                a.iter()
                    .zip(b.iter())
                    .fold((0i32, 0i32, 0i32), |(d, na, nb), (&x, &y)| {
                        let (x, y) = (i32::from(x as i8), i32::from(y as i8));
                        (d + x * y, na + x * x, nb + y * y)
                    });
            // Scale cancels in the ratio.
            (d as f32, na as f32, nb as f32)
        }
        ScalarKind::U64 => unreachable!("word metrics never reach the cosine kernel"),
    };
    let denom = (norm_a * norm_b).sqrt();
    if denom == 0.0 {
        // Two zero vectors coincide; one zero vector is maximally far.
        return if norm_a == norm_b { 0.0 } else { 1.0 };
    }
    1.0 - dot / denom
}

fn hamming(a: &[u8], b: &[u8]) -> f32 {
    a.chunks_exact(8)
        .zip(b.chunks_exact(8))
        .map(|(x, y)| (read_u64(x) ^ read_u64(y)).count_ones())
        .sum::<u32>() as f32
}

/// Merge walk over two strictly-increasing id sets.
fn jaccard(a: &[u8], b: &[u8]) -> f32 {
    let mut lhs = a.chunks_exact(8).map(read_u64).peekable();
    let mut rhs = b.chunks_exact(8).map(read_u64).peekable();
    let mut intersection = 0usize;
    let mut union = 0usize;
    loop {
        match (lhs.peek(), rhs.peek()) {
            (Some(&x), Some(&y)) => {
                union += 1;
                match x.cmp(&y) {
                    std::cmp::Ordering::Equal => {
                        intersection += 1;
                        lhs.next();
                        rhs.next();
                    }
                    std::cmp::Ordering::Less => {
                        lhs.next();
                    }
                    std::cmp::Ordering::Greater => {
                        rhs.next();
                    }
                }
            }
            (Some(_), None) => {
                union += 1;
                lhs.next();
            }
            (None, Some(_)) => {
                union += 1;
                rhs.next();
            }
            (None, None) => break,
        }
    }
    if union == 0 {
        return 0.0;
    }
    1.0 - intersection as f32 / union as f32
}
