//! First-order optimizers over flat parameter vectors.

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// An update rule `params ← params − step(grad)`.
pub trait Optimizer: Send {
    fn step(&mut self, params: ArrayViewMut1<'_, f32>, grad: ArrayView1<'_, f32>);

    fn lr(&self) -> f32;
}

/// Plain gradient descent.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub lr: f32,
}

impl Optimizer for Sgd {
    fn step(&mut self, mut params: ArrayViewMut1<'_, f32>, grad: ArrayView1<'_, f32>) {
        params.scaled_add(-self.lr, &grad);
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    m: Array1<f32>,
    v: Array1<f32>,
    t: i32,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: Array1::zeros(0),
            v: Array1::zeros(0),
            t: 0,
        }
    }

    /// Steps taken so far.
    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, mut params: ArrayViewMut1<'_, f32>, grad: ArrayView1<'_, f32>) {
        if self.m.len() != params.len() {
            self.m = Array1::zeros(params.len());
            self.v = Array1::zeros(params.len());
            self.t = 0;
        }
        self.t += 1;
        let (b1, b2) = (self.beta1, self.beta2);
        let c1 = 1.0 - b1.powi(self.t);
        let c2 = 1.0 - b2.powi(self.t);
        let (lr, eps) = (self.lr, self.eps);

        Zip::from(&mut params)
            .and(&grad)
            .and(&mut self.m)
            .and(&mut self.v)
            .for_each(|p, &g, m, v| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / c1;
                let v_hat = *v / c2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }

    fn lr(&self) -> f32 {
        self.lr
    }
}

/// Rescale `grad` in place so its L2 norm is at most `max_norm`. Returns the norm before
/// clipping.
pub fn clip_grad_norm(grad: &mut ArrayViewMut1<'_, f32>, max_norm: f32) -> f32 {
    let norm = grad.iter().map(|g| (*g as f64) * (*g as f64)).sum::<f64>().sqrt() as f32;
    if norm > max_norm {
        let coef = max_norm / (norm + 1e-6);
        grad.mapv_inplace(|g| g * coef);
    }
    norm
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            other => Err(Error::Config(format!(
                "unknown optimizer `{other}` (expected one of: sgd, adam)"
            ))),
        }
    }
}

/// Optimizer settings shared by the forward and backward models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub lr: f32,
    /// Clip the gradient L2 norm before each step.
    pub max_grad_norm: Option<f32>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            lr: 1e-3,
            max_grad_norm: None,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.lr > 0.0) || !self.lr.is_finite() {
            return Err(Error::Config(format!("learning rate must be positive, got {}", self.lr)));
        }
        if let Some(c) = self.max_grad_norm {
            if !(c > 0.0) {
                return Err(Error::Config("max_grad_norm must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Box<dyn Optimizer> {
        match self.kind {
            OptimizerKind::Sgd => Box::new(Sgd { lr: self.lr }),
            OptimizerKind::Adam => Box::new(Adam::new(self.lr)),
        }
    }
}
