//! Endpoint distributions.
//!
//! `p0` only needs to be sampled and scored ([`Prior`]). `p1` is usually an unnormalized
//! target: it must expose a log-density and its gradient ([`Target`]), and may or may not have
//! a tractable sampler.

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

/// The source distribution `p0`.
pub trait Prior: Send + Sync {
    fn dim(&self) -> usize;

    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Array2<f32>;

    /// Per-row log-density.
    fn log_density(&self, x: &ArrayView2<f32>) -> Array1<f32>;
}

/// The target distribution `p1`.
pub trait Target: Send + Sync {
    fn dim(&self) -> usize;

    /// Per-row (possibly unnormalized) log-density.
    fn log_density(&self, x: &ArrayView2<f32>) -> Array1<f32>;

    /// \(\nabla_x \log p_1(x)\), row-wise.
    fn score(&self, x: &ArrayView2<f32>) -> Array2<f32>;

    /// Per-row log-reward used for monitoring. Defaults to the log-density.
    fn log_reward(&self, x: &ArrayView2<f32>) -> Array1<f32> {
        self.log_density(x)
    }

    /// Exact samples, when `p1` is analytically tractable.
    ///
    /// `None` means "not available"; metrics that need ground-truth samples are skipped.
    fn sample(&self, _n: usize, _rng: &mut dyn RngCore) -> Option<Array2<f32>> {
        None
    }
}

/// Isotropic Gaussian \(\mathcal N(\mu, \sigma^2 I)\).
#[derive(Debug, Clone)]
pub struct Gaussian {
    mean: Array1<f32>,
    std: f32,
}

impl Gaussian {
    pub fn new(mean: Array1<f32>, std: f32) -> Result<Self> {
        if mean.is_empty() {
            return Err(Error::Domain("gaussian mean must be non-empty"));
        }
        if !(std > 0.0) || !std.is_finite() {
            return Err(Error::Domain("gaussian std must be positive and finite"));
        }
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(Error::Domain("gaussian mean must be finite"));
        }
        Ok(Self { mean, std })
    }

    /// \(\mathcal N(0, I)\) in `d` dimensions.
    pub fn standard(d: usize) -> Result<Self> {
        Self::new(Array1::zeros(d), 1.0)
    }

    pub fn mean(&self) -> ArrayView1<'_, f32> {
        self.mean.view()
    }

    pub fn std(&self) -> f32 {
        self.std
    }

    fn draw(&self, n: usize, rng: &mut dyn RngCore) -> Array2<f32> {
        let d = self.mean.len();
        let mut out = Array2::<f32>::zeros((n, d));
        for i in 0..n {
            for k in 0..d {
                let z: f32 = StandardNormal.sample(rng);
                out[[i, k]] = self.mean[k] + self.std * z;
            }
        }
        out
    }

    fn log_pdf(&self, x: &ArrayView2<f32>) -> Array1<f32> {
        let d = self.mean.len();
        debug_assert_eq!(x.ncols(), d);
        let var = (self.std as f64) * (self.std as f64);
        let norm = -0.5 * (d as f64) * (2.0 * core::f64::consts::PI * var).ln();
        let mut out = Array1::<f32>::zeros(x.nrows());
        for i in 0..x.nrows() {
            let mut s = 0.0f64;
            for k in 0..d {
                let r = (x[[i, k]] - self.mean[k]) as f64;
                s += r * r;
            }
            out[i] = (norm - 0.5 * s / var) as f32;
        }
        out
    }
}

impl Prior for Gaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Array2<f32> {
        self.draw(n, rng)
    }

    fn log_density(&self, x: &ArrayView2<f32>) -> Array1<f32> {
        self.log_pdf(x)
    }
}

impl Target for Gaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn log_density(&self, x: &ArrayView2<f32>) -> Array1<f32> {
        self.log_pdf(x)
    }

    fn score(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        let inv_var = 1.0 / (self.std * self.std);
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for k in 0..row.len() {
                row[k] = (self.mean[k] - row[k]) * inv_var;
            }
        }
        out
    }

    fn sample(&self, n: usize, rng: &mut dyn RngCore) -> Option<Array2<f32>> {
        Some(self.draw(n, rng))
    }
}
