//! Replay buffer whose samples are refined toward the target before reuse.
//!
//! Cached rows go stale as the forward model improves. On every `sample`, the drawn rows (plus
//! a fraction of fresh noise chains) are pushed toward \(p_1\) with a short Markov chain:
//!
//! - Langevin steps \(x \leftarrow x + h\,\nabla\log p_1(x) + \sqrt{2h}\,\varepsilon\),
//!   unadjusted (`legacy`) or Metropolis-adjusted (`mala`);
//! - every `hmc_freq`-th step is a Metropolis-adjusted HMC step with `hmc_leapfrog_steps`
//!   leapfrog steps of size \(\sqrt{2h}\).
//!
//! The step size follows a geometric annealing schedule from `init_step_size` down to
//! `init_step_size * anneal_value`. Refinement never touches the cached rows: `update` stores
//! raw terminal states.

use super::simple::SimpleBuffer;
use super::ReplayBuffer;
use crate::distribution::Target;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::trace;

/// MALA acceptance rate the adaptive step-size multiplier steers toward.
const MALA_TARGET_ACCEPTANCE: f32 = 0.574;

/// Which Langevin kernel runs between HMC steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSampler {
    /// Unadjusted Langevin with the annealed step size.
    #[default]
    Legacy,
    /// Metropolis-adjusted Langevin; the step size adapts toward a 0.574 acceptance rate.
    Mala,
}

impl FromStr for ChainSampler {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "mala" => Ok(Self::Mala),
            other => Err(Error::Config(format!(
                "unknown buffer sampler `{other}` (expected one of: legacy, mala)"
            ))),
        }
    }
}

/// Chain parameters of a [`LangevinBuffer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LangevinConfig {
    /// Markov-chain steps per `sample` call.
    pub num_steps: usize,
    pub init_step_size: f32,
    /// Final step size is `init_step_size * anneal_value` (1.0 = fixed step size).
    pub anneal_value: f32,
    /// Fraction of chains started from `N(0, I)` instead of buffer rows.
    pub noise_start_ratio: f32,
    /// Every `hmc_freq`-th step is an HMC step; 0 disables HMC.
    pub hmc_freq: usize,
    pub hmc_leapfrog_steps: usize,
    pub sampler: ChainSampler,
}

impl Default for LangevinConfig {
    fn default() -> Self {
        Self {
            num_steps: 20,
            init_step_size: 0.1,
            anneal_value: 0.1,
            noise_start_ratio: 0.5,
            hmc_freq: 4,
            hmc_leapfrog_steps: 5,
            sampler: ChainSampler::Legacy,
        }
    }
}

impl LangevinConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.init_step_size > 0.0) || !self.init_step_size.is_finite() {
            return Err(Error::Config("langevin init_step_size must be positive and finite".into()));
        }
        if !(self.anneal_value > 0.0) || !self.anneal_value.is_finite() {
            return Err(Error::Config("langevin anneal_value must be positive and finite".into()));
        }
        if !(0.0..=1.0).contains(&self.noise_start_ratio) {
            return Err(Error::Config("langevin noise_start_ratio must be in [0, 1]".into()));
        }
        if self.hmc_freq > 0 && self.hmc_leapfrog_steps == 0 {
            return Err(Error::Config("hmc_leapfrog_steps must be >= 1 when hmc_freq > 0".into()));
        }
        Ok(())
    }

    /// Annealed step size for chain step `s`.
    pub fn step_size(&self, s: usize) -> f32 {
        if self.num_steps <= 1 {
            return self.init_step_size;
        }
        let frac = s as f32 / (self.num_steps - 1) as f32;
        self.init_step_size * self.anneal_value.powf(frac)
    }

    #[inline]
    fn is_hmc_step(&self, s: usize) -> bool {
        self.hmc_freq > 0 && (s + 1) % self.hmc_freq == 0
    }
}

/// A [`SimpleBuffer`] plus Markov-chain refinement against `p1` on every `sample`.
pub struct LangevinBuffer {
    inner: SimpleBuffer,
    target: Arc<dyn Target>,
    cfg: LangevinConfig,
    rng: ChaCha8Rng,
    /// Multiplicative step-size adaptation (MALA only).
    adapt: f32,
}

impl LangevinBuffer {
    pub fn new(
        size: usize,
        update_fraction: f32,
        target: Arc<dyn Target>,
        cfg: LangevinConfig,
        seed: u64,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            inner: SimpleBuffer::new(size, update_fraction, seed)?,
            target,
            cfg,
            rng: ChaCha8Rng::seed_from_u64(seed ^ 0x9e37_79b9_7f4a_7c15),
            adapt: 1.0,
        })
    }

    pub fn config(&self) -> &LangevinConfig {
        &self.cfg
    }

    /// The unrefined cache.
    pub fn raw(&self) -> &SimpleBuffer {
        &self.inner
    }

    fn langevin_step(&mut self, x: &mut Array2<f32>, h: f32, step: usize) -> Result<()> {
        let score = checked_score(self.target.as_ref(), &x.view(), step)?;
        let noise = (2.0 * h).sqrt();

        match self.cfg.sampler {
            ChainSampler::Legacy => {
                for (v, g) in x.iter_mut().zip(score.iter()) {
                    let e: f32 = StandardNormal.sample(&mut self.rng);
                    *v += h * g + noise * e;
                }
            }
            ChainSampler::Mala => {
                let mut y = x.clone();
                for (v, g) in y.iter_mut().zip(score.iter()) {
                    let e: f32 = StandardNormal.sample(&mut self.rng);
                    *v += h * g + noise * e;
                }
                let score_y = self.target.score(&y.view());
                let logp_x = self.target.log_density(&x.view());
                let logp_y = self.target.log_density(&y.view());

                let mut accepted = 0usize;
                for i in 0..x.nrows() {
                    let (xi, yi) = (x.row(i), y.row(i));
                    let (gx, gy) = (score.row(i), score_y.row(i));
                    // log q(a | b) for the Langevin proposal b -> a
                    let mut fwd = 0.0f32;
                    let mut rev = 0.0f32;
                    for k in 0..xi.len() {
                        let a = yi[k] - xi[k] - h * gx[k];
                        let b = xi[k] - yi[k] - h * gy[k];
                        fwd += a * a;
                        rev += b * b;
                    }
                    let log_alpha = logp_y[i] - logp_x[i] - rev / (4.0 * h) + fwd / (4.0 * h);
                    if accept(log_alpha, &mut self.rng) {
                        x.row_mut(i).assign(&yi);
                        accepted += 1;
                    }
                }

                let rate = accepted as f32 / x.nrows().max(1) as f32;
                self.adapt = if rate > MALA_TARGET_ACCEPTANCE {
                    (self.adapt * 1.1).min(1e3)
                } else {
                    (self.adapt * 0.9).max(1e-3)
                };
                trace!(step, rate, adapt = self.adapt, "mala step");
            }
        }
        Ok(())
    }

    fn hmc_step(&mut self, x: &mut Array2<f32>, h: f32, step: usize) -> Result<()> {
        let eps = (2.0 * h).sqrt();
        let n_leapfrog = self.cfg.hmc_leapfrog_steps;
        let grad0 = checked_score(self.target.as_ref(), &x.view(), step)?;
        let logp0 = self.target.log_density(&x.view());

        let mut p = Array2::<f32>::zeros(x.dim());
        for v in p.iter_mut() {
            *v = StandardNormal.sample(&mut self.rng);
        }
        let kinetic0 = half_sq_norm_rows(&p);

        let mut q = x.clone();
        p.scaled_add(0.5 * eps, &grad0);
        for l in 0..n_leapfrog {
            q.scaled_add(eps, &p);
            let g = self.target.score(&q.view());
            let scale = if l + 1 == n_leapfrog { 0.5 * eps } else { eps };
            p.scaled_add(scale, &g);
        }
        let logp1 = self.target.log_density(&q.view());
        let kinetic1 = half_sq_norm_rows(&p);

        let mut accepted = 0usize;
        for i in 0..x.nrows() {
            let finite = logp1[i].is_finite() && q.row(i).iter().all(|v| v.is_finite());
            if !finite {
                continue;
            }
            let log_alpha = (logp1[i] - kinetic1[i]) - (logp0[i] - kinetic0[i]);
            if accept(log_alpha, &mut self.rng) {
                x.row_mut(i).assign(&q.row(i));
                accepted += 1;
            }
        }
        trace!(step, accepted, "hmc step");
        Ok(())
    }
}

fn checked_score(target: &dyn Target, x: &ArrayView2<f32>, step: usize) -> Result<Array2<f32>> {
    let score = target.score(x);
    if score.iter().any(|v| !v.is_finite()) {
        return Err(Error::Numerical {
            step,
            quantity: "target score",
        });
    }
    Ok(score)
}

fn half_sq_norm_rows(p: &Array2<f32>) -> Array1<f32> {
    p.map_axis(Axis(1), |row| 0.5 * row.iter().map(|v| v * v).sum::<f32>())
}

fn accept<R: Rng + ?Sized>(log_alpha: f32, rng: &mut R) -> bool {
    if log_alpha.is_nan() {
        return false;
    }
    log_alpha >= 0.0 || rng.random::<f32>().ln() < log_alpha
}

impl ReplayBuffer for LangevinBuffer {
    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        if self.inner.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        let d = self.inner.dim().unwrap_or(0);
        let n_noise = ((self.cfg.noise_start_ratio * batch_size as f32).round() as usize)
            .min(batch_size);

        let mut x = Array2::<f32>::zeros((batch_size, d));
        for i in 0..n_noise {
            for k in 0..d {
                x[[i, k]] = StandardNormal.sample(&mut self.rng);
            }
        }
        let cached = self.inner.draw_with(batch_size - n_noise, &mut self.rng);
        x.slice_mut(ndarray::s![n_noise.., ..]).assign(&cached);

        for s in 0..self.cfg.num_steps {
            let h = self.cfg.step_size(s);
            if self.cfg.is_hmc_step(s) {
                self.hmc_step(&mut x, h, s)?;
            } else {
                let h = match self.cfg.sampler {
                    ChainSampler::Legacy => h,
                    ChainSampler::Mala => h * self.adapt,
                };
                self.langevin_step(&mut x, h, s)?;
            }
        }
        Ok(x)
    }

    fn update(&mut self, batch: &ArrayView2<f32>) -> Result<()> {
        self.inner.update(batch)
    }

    fn clear(&mut self) {
        self.inner.clear();
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}
