//! Small numeric helpers shared by model fitting and the filters.
//!
//! All solvers work in f64 even though point data is f32; fitting
//! accumulates products of pixel coordinates and loses precision fast in
//! single precision.

/// FNV-1a, used for configuration fingerprints. `DefaultHasher` is not
/// guaranteed stable across Rust releases, and fingerprints end up in
/// file names.
pub(crate) struct Fnv1a(u64);

impl Fnv1a {
    pub(crate) fn new() -> Self {
        Fnv1a(0xcbf2_9ce4_8422_2325)
    }

    pub(crate) fn write_u32(&mut self, v: u32) {
        self.write_u64(u64::from(v));
    }

    pub(crate) fn write_u64(&mut self, v: u64) {
        for byte in v.to_le_bytes() {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }

    pub(crate) fn finish(&self) -> u64 {
        self.0
    }
}

/// Solve `A x = b` for a symmetric positive-definite `A` via Cholesky
/// decomposition.
///
/// Returns `None` when the matrix is not positive definite (degenerate
/// point configurations).
pub fn solve_symmetric(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let n = b.len();
    debug_assert_eq!(a.len(), n);

    // Decompose A = L L^T.
    let mut l = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 1e-12 {
                    return None;
                }
                l[i][j] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }

    // Forward substitution: L y = b.
    let mut y = vec![0.0f64; n];
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[i][k] * y[k];
        }
        y[i] = sum / l[i][i];
    }

    // Back substitution: L^T x = y.
    let mut x = vec![0.0f64; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for k in (i + 1)..n {
            sum -= l[k][i] * x[k];
        }
        x[i] = sum / l[i][i];
    }

    Some(x)
}

/// Unnormalized Gaussian weight for distance `d` and standard deviation
/// `sigma`.
#[inline]
pub fn gaussian(d: f32, sigma: f32) -> f32 {
    if sigma <= 0.0 {
        return if d == 0.0 { 1.0 } else { 0.0 };
    }
    let t = f64::from(d) / f64::from(sigma);
    (-0.5 * t * t).exp() as f32
}

/// Mean and standard deviation of a sample.
///
/// Returns `(0.0, 0.0)` for an empty slice.
pub fn mean_and_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean: f64 = values.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
    let var: f64 = values
        .iter()
        .map(|&v| {
            let d = f64::from(v) - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    (mean as f32, var.sqrt() as f32)
}

/// Median of a sample (averages the two middle elements for even counts).
///
/// Returns 0.0 for an empty slice.
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f32> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) * 0.5
    } else {
        sorted[mid]
    }
}
