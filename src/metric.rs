//! Distance metrics.
//!
//! A closed set of metrics dispatched by tag. Every metric sorts
//! ascending: smaller means closer, with dot product negated to fit.
//! The batch form reuses the scalar kernel per vector so results are
//! bitwise-equal to repeated scalar calls.

use serde::{Deserialize, Serialize};

/// Distance metric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Euclidean,
    Cosine,
    Manhattan,
    Dot,
    Angular,
}

impl Metric {
    /// Pairwise distance. Operand lengths must match; this is the
    /// caller's contract (the engine validates at its boundary).
    pub fn distance(&self, u: &[f32], v: &[f32]) -> f32 {
        debug_assert_eq!(u.len(), v.len(), "metric operands must share dimension");
        match self {
            Metric::Euclidean => l2_squared(u, v).sqrt(),
            Metric::Manhattan => u
                .iter()
                .zip(v)
                .fold(0.0f32, |acc, (a, b)| acc + (a - b).abs()),
            Metric::Cosine => {
                let (d, nu, nv) = dot_and_norms(u, v);
                let denom = nu * nv;
                if denom == 0.0 {
                    // Zero-vector pair is defined as maximally distant.
                    1.0
                } else {
                    1.0 - d / denom
                }
            }
            Metric::Angular => {
                let (d, nu, nv) = dot_and_norms(u, v);
                let denom = nu * nv;
                let cos = if denom == 0.0 { 0.0 } else { d / denom };
                cos.clamp(-1.0, 1.0).acos() / std::f32::consts::PI
            }
            Metric::Dot => -dot(u, v),
        }
    }

    /// Batched distance from one query to many vectors.
    pub fn batch_distance(&self, q: &[f32], vs: &[&[f32]]) -> Vec<f32> {
        vs.iter().map(|v| self.distance(q, v)).collect()
    }

    /// Monotone lower bound used by the beam search. The trivial
    /// bound `d_lb = d` is exact for every metric here.
    #[inline]
    pub fn lower_bound(&self, u: &[f32], v: &[f32]) -> f32 {
        self.distance(u, v)
    }

    /// Whether ADC tables decompose as a plain per-subspace sum.
    /// Cosine and angular need the stored vector norm as well.
    pub fn adc_decomposable(&self) -> bool {
        matches!(self, Metric::Euclidean | Metric::Manhattan | Metric::Dot)
    }
}

#[inline]
pub(crate) fn dot(u: &[f32], v: &[f32]) -> f32 {
    u.iter().zip(v).fold(0.0f32, |acc, (a, b)| acc + a * b)
}

#[inline]
pub(crate) fn l2_squared(u: &[f32], v: &[f32]) -> f32 {
    u.iter().zip(v).fold(0.0f32, |acc, (a, b)| {
        let d = a - b;
        acc + d * d
    })
}

#[inline]
pub(crate) fn l2_norm(u: &[f32]) -> f32 {
    dot(u, u).sqrt()
}

fn dot_and_norms(u: &[f32], v: &[f32]) -> (f32, f32, f32) {
    let mut d = 0.0f32;
    let mut nu = 0.0f32;
    let mut nv = 0.0f32;
    for (a, b) in u.iter().zip(v) {
        d += a * b;
        nu += a * a;
        nv += b * b;
    }
    (d, nu.sqrt(), nv.sqrt())
}
