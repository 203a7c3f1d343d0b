//! Linear drift parameterization.
//!
//! [`LinearDrift`] maps `[x; t; 1]` through one weight matrix. Its vector-Jacobian product is
//! written out by hand, which is all the losses need to push gradients into the parameters.

use crate::model::{DriftModel, ModelOutput, TrainableDrift};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1};

/// A time-conditioned linear drift:
///
/// \[
/// f_\theta(x, t) = W \cdot [x; t; 1],
/// \]
///
/// where `W` is a `d × (d+2)` matrix stored row-major in a flat parameter vector.
#[derive(Debug, Clone)]
pub struct LinearDrift {
    d: usize,
    params: Array1<f32>,
    grad: Array1<f32>,
}

impl LinearDrift {
    pub fn new_zeros(d: usize) -> Self {
        let n = d * (d + 2);
        Self {
            d,
            params: Array1::zeros(n),
            grad: Array1::zeros(n),
        }
    }

    /// Number of input features, `d + 2`.
    #[inline]
    pub fn n_features(&self) -> usize {
        self.d + 2
    }

    /// Entry `W[i, k]`.
    #[inline]
    pub fn weight(&self, i: usize, k: usize) -> f32 {
        self.params[i * self.n_features() + k]
    }

    #[inline]
    pub fn set_weight(&mut self, i: usize, k: usize, value: f32) {
        let f = self.n_features();
        self.params[i * f + k] = value;
    }

    /// The bias column `W[:, d+1]`.
    pub fn bias(&self) -> Array1<f32> {
        Array1::from_shape_fn(self.d, |i| self.weight(i, self.d + 1))
    }
}

impl DriftModel for LinearDrift {
    fn dim(&self) -> usize {
        self.d
    }

    fn evaluate(&self, x: &ArrayView2<f32>, t: &ArrayView1<f32>) -> ModelOutput {
        let d = self.d;
        let f = self.n_features();
        let n = x.nrows();
        debug_assert_eq!(x.ncols(), d);
        debug_assert_eq!(t.len(), n);

        // features = [x (d), t, 1]
        let mut out = Array2::<f32>::zeros((n, d));
        for r in 0..n {
            for i in 0..d {
                let row = i * f;
                let mut s = 0.0f32;
                for k in 0..d {
                    s += self.params[row + k] * x[[r, k]];
                }
                s += self.params[row + d] * t[r];
                s += self.params[row + d + 1];
                out[[r, i]] = s;
            }
        }
        ModelOutput::drift_only(out)
    }
}

impl TrainableDrift for LinearDrift {
    fn params(&self) -> ArrayView1<'_, f32> {
        self.params.view()
    }

    fn params_mut(&mut self) -> ArrayViewMut1<'_, f32> {
        self.params.view_mut()
    }

    fn grad(&self) -> ArrayView1<'_, f32> {
        self.grad.view()
    }

    fn params_and_grad(&mut self) -> (ArrayViewMut1<'_, f32>, ArrayView1<'_, f32>) {
        (self.params.view_mut(), self.grad.view())
    }

    fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    fn accumulate_grad(
        &mut self,
        x: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        grad_drift: &ArrayView2<f32>,
    ) {
        let d = self.d;
        let f = self.n_features();
        let n = x.nrows();
        debug_assert_eq!(x.ncols(), d);
        debug_assert_eq!(t.len(), n);
        debug_assert_eq!(grad_drift.dim(), (n, d));

        // dW[i, feat] += g[i] * feat
        for r in 0..n {
            for i in 0..d {
                let g = grad_drift[[r, i]];
                if g == 0.0 {
                    continue;
                }
                let row = i * f;
                for k in 0..d {
                    self.grad[row + k] += g * x[[r, k]];
                }
                self.grad[row + d] += g * t[r];
                self.grad[row + d + 1] += g;
            }
        }
    }
}
