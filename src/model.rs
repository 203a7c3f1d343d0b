//! Drift model capabilities.
//!
//! Anything that produces a drift for a batch of states at a batch of times is a
//! [`DriftModel`]: trainable networks and the fixed reference process alike. The sampler never
//! special-cases either.

use ndarray::{Array2, ArrayView1, ArrayView2, ArrayViewMut1};

/// Output of one model evaluation.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Drift, same shape as the input batch.
    pub drift: Array2<f32>,
    /// Optional additive correction to the base log-variance `ln(2 dt)`.
    pub log_var: Option<Array2<f32>>,
}

impl ModelOutput {
    pub fn drift_only(drift: Array2<f32>) -> Self {
        Self {
            drift,
            log_var: None,
        }
    }
}

/// A drift \(f(x, t)\) over `dim`-dimensional states.
pub trait DriftModel {
    fn dim(&self) -> usize;

    /// Evaluate on a batch `x` (`n × dim`) at times `t` (length `n`).
    fn evaluate(&self, x: &ArrayView2<f32>, t: &ArrayView1<f32>) -> ModelOutput;
}

/// A drift model with a flat parameter vector and accumulated gradients.
///
/// There is no autograd here: losses compute \(\partial L / \partial f\) at each evaluated
/// point and the model turns it into parameter gradients via [`Self::accumulate_grad`].
pub trait TrainableDrift: DriftModel + Send {
    fn params(&self) -> ArrayView1<'_, f32>;

    fn params_mut(&mut self) -> ArrayViewMut1<'_, f32>;

    fn grad(&self) -> ArrayView1<'_, f32>;

    /// Parameters (mutable) and gradient (shared) at once, for optimizer steps.
    fn params_and_grad(&mut self) -> (ArrayViewMut1<'_, f32>, ArrayView1<'_, f32>);

    fn zero_grad(&mut self);

    /// Add the vector-Jacobian product \(\sum_i g_i^\top \partial f(x_i, t_i) / \partial \theta\)
    /// to the gradient, where `grad_drift` holds \(g_i\) row-wise.
    fn accumulate_grad(
        &mut self,
        x: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        grad_drift: &ArrayView2<f32>,
    );
}

/// Parameter-free Ornstein-Uhlenbeck reference drift \(f(x, t) = -\alpha\gamma x\).
///
/// Used as the forward operand on the bootstrap iteration, before the forward model has been
/// trained.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceProcess {
    pub dim: usize,
    pub alpha: f32,
    pub gamma: f32,
}

impl ReferenceProcess {
    pub fn new(dim: usize, alpha: f32, gamma: f32) -> Self {
        Self { dim, alpha, gamma }
    }

    /// The single-coefficient variant \(f(x, t) = -\alpha x\).
    pub fn linear(dim: usize, alpha: f32) -> Self {
        Self::new(dim, alpha, 1.0)
    }

    #[inline]
    pub fn decay(&self) -> f32 {
        self.alpha * self.gamma
    }
}

impl DriftModel for ReferenceProcess {
    fn dim(&self) -> usize {
        self.dim
    }

    fn evaluate(&self, x: &ArrayView2<f32>, _t: &ArrayView1<f32>) -> ModelOutput {
        let k = -self.decay();
        ModelOutput::drift_only(x.mapv(|v| k * v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn reference_variants_agree_when_gamma_is_one() {
        let x = array![[1.0f32, -2.0], [0.5, 4.0]];
        let t = Array1::<f32>::zeros(2);
        let a = ReferenceProcess::new(2, 0.7, 1.0).evaluate(&x.view(), &t.view());
        let b = ReferenceProcess::linear(2, 0.7).evaluate(&x.view(), &t.view());
        assert_eq!(a.drift, b.drift);
        assert!(a.log_var.is_none());
        assert!((a.drift[[0, 1]] - 1.4).abs() < 1e-6);
    }

    #[test]
    fn reference_drift_scales_with_alpha_and_gamma() {
        let x = array![[2.0f32, 0.0]];
        let t = Array1::<f32>::zeros(1);
        let out = ReferenceProcess::new(2, 0.5, 3.0).evaluate(&x.view(), &t.view());
        assert!((out.drift[[0, 0]] + 3.0).abs() < 1e-6);
        assert_eq!(out.drift[[0, 1]], 0.0);
    }
}
