//! Statistics shared by the guardrail monitor and the decision engine:
//! streaming moments, percentiles, a χ² goodness-of-fit p-value, a one-sided
//! Welch t-test, and a seeded bootstrap percentile interval.
//!
//! Distribution CDFs come from `statrs`; the bootstrap is driven by a seeded
//! `StdRng` so every interval is reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use statrs::distribution::{ChiSquared, ContinuousCDF, StudentsT};

/// Welford's streaming mean/variance accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Welford {
    n: u64,
    mean: f64,
    m2: f64,
}

impl Welford {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        self.m2 += delta * (x - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn mean(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance (n−1 denominator).
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2 / ((self.n - 1) as f64)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

impl FromIterator<f64> for Welford {
    fn from_iter<T: IntoIterator<Item = f64>>(iter: T) -> Self {
        let mut w = Welford::new();
        for x in iter {
            w.push(x);
        }
        w
    }
}

/// Nearest-rank percentile (`q ∈ [0,1]`) over an unsorted slice.
///
/// Returns 0 for an empty input.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let q = q.clamp(0.0, 1.0);
    let rank = ((q * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

/// χ² goodness-of-fit p-value of `observed` counts against `expected`.
///
/// `None` when the test is undefined (mismatched lengths, fewer than two
/// cells, or non-positive expectations).
pub fn chi_square_p(observed: &[f64], expected: &[f64]) -> Option<f64> {
    if observed.len() != expected.len() || observed.len() < 2 {
        return None;
    }
    if expected.iter().any(|&e| !(e.is_finite() && e > 0.0)) {
        return None;
    }
    let stat: f64 = observed
        .iter()
        .zip(expected)
        .map(|(&o, &e)| (o - e).powi(2) / e)
        .sum();
    let dof = (observed.len() - 1) as f64;
    let dist = ChiSquared::new(dof).ok()?;
    Some((1.0 - dist.cdf(stat)).clamp(0.0, 1.0))
}

/// One-sided Welch t-test p-value for H₁: mean₁ > mean₂.
///
/// `None` when either sample is too small to test.
pub fn welch_one_sided_p(
    n1: u64,
    mean1: f64,
    var1: f64,
    n2: u64,
    mean2: f64,
    var2: f64,
) -> Option<f64> {
    if n1 < 2 || n2 < 2 {
        return None;
    }
    let (n1f, n2f) = (n1 as f64, n2 as f64);
    let se1 = var1 / n1f;
    let se2 = var2 / n2f;
    let se = (se1 + se2).sqrt();
    if !(se.is_finite() && se > 0.0) {
        // Zero pooled variance: the verdict is decided by the means alone.
        return Some(if mean1 > mean2 { 0.0 } else { 1.0 });
    }
    let t = (mean1 - mean2) / se;
    // Welch–Satterthwaite degrees of freedom.
    let dof = (se1 + se2).powi(2)
        / (se1.powi(2) / (n1f - 1.0) + se2.powi(2) / (n2f - 1.0));
    let dist = StudentsT::new(0.0, 1.0, dof.max(1.0)).ok()?;
    Some((1.0 - dist.cdf(t)).clamp(0.0, 1.0))
}

/// Seeded bootstrap percentile interval for an arbitrary statistic over an
/// index set of size `n`.
///
/// `stat` receives a resampled index multiset (with replacement) and returns
/// the statistic of interest. Returns the `(alpha/2, 1 − alpha/2)` percentile
/// interval over `resamples` replicates; `None` for empty inputs.
pub fn bootstrap_ci(
    n: usize,
    resamples: usize,
    seed: u64,
    alpha: f64,
    mut stat: impl FnMut(&[usize]) -> f64,
) -> Option<(f64, f64)> {
    if n == 0 || resamples == 0 {
        return None;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut replicates = Vec::with_capacity(resamples);
    let mut indices = vec![0usize; n];
    for _ in 0..resamples {
        for slot in indices.iter_mut() {
            *slot = rng.gen_range(0..n);
        }
        replicates.push(stat(&indices));
    }
    let lo = percentile(&replicates, alpha / 2.0);
    let hi = percentile(&replicates, 1.0 - alpha / 2.0);
    Some((lo, hi))
}
