//! The alternating forward/backward trainer.
//!
//! One SB iteration (`sb_iter = 0, 1, 2, …`) runs three phases in order:
//!
//! 1. **backward**: with the forward model's EMA shadow applied, fit the backward model to paths
//!    simulated forward from `x0 ~ p0`. On `sb_iter == 0` the paths come from the reference
//!    process instead of the (untrained) forward model.
//! 2. **forward**: with the backward model's EMA shadow applied, fit the forward model with the
//!    trajectory-balance loss (`n_trajectories == 1`) or VarGrad (`n_trajectories > 1`) on a
//!    start batch that mixes fresh `p0` samples with off-policy starts recovered from the
//!    replay buffer by backward simulation. The forward losses refill the buffer.
//! 3. **evaluate**: ELBO / importance-weighted bounds and the configured visual hooks.
//!
//! Shadows are applied through [`EmaScope`] guards, so a numerical failure mid-loop never
//! leaves a model with its shadow swapped in.

use crate::buffer::{build_buffer, ReplayBuffer};
use crate::config::{BridgeConfig, LoggingData};
use crate::distribution::{Prior, Target};
use crate::ema::{Ema, EmaScope};
use crate::losses::{backward_tlm_loss, forward_tb_loss, forward_vargrad_loss};
use crate::metrics::{compute_elbo, w2_distance};
use crate::model::{DriftModel, ReferenceProcess, TrainableDrift};
use crate::optim::{clip_grad_norm, Adam, Optimizer};
use crate::sampler::{simulate, simulate_last, Direction, MatchingMethod, TimeGrid};
use crate::sink::{record, MetricsSink, Record, Visualizer};
use crate::{Error, Result};
use ndarray::{array, Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::{debug, info, info_span};

/// Buffer rows handed to the visualizer in `images` mode.
const BUFFER_PREVIEW_ROWS: usize = 36;
const W2_MAX_ITER: usize = 2000;
const W2_TOL: f32 = 1e-3;

/// On/off-policy composition of forward-training start batches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingPolicy {
    pub off_policy_fraction: f32,
    /// Mixing is disabled while `sb_iter <= start_mixed_from`.
    pub start_mixed_from: usize,
}

impl MixingPolicy {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        Self {
            off_policy_fraction: cfg.off_policy_fraction,
            start_mixed_from: cfg.start_mixed_from.max(0) as usize,
        }
    }

    /// How many of `n` start rows should come from the replay buffer at `sb_iter`.
    pub fn off_policy_rows(&self, sb_iter: usize, n: usize) -> usize {
        if self.off_policy_fraction <= 0.0 || sb_iter <= self.start_mixed_from {
            0
        } else if self.off_policy_fraction >= 1.0 {
            n
        } else {
            ((self.off_policy_fraction * n as f32).floor() as usize).min(n)
        }
    }
}

/// Build a forward-training start batch of `n` rows.
///
/// Off-policy rows are buffer samples pulled back to time 0 through `bwd`; they come first,
/// followed by fresh `p0` samples. An empty buffer falls back to a fully on-policy batch.
#[allow(clippy::too_many_arguments)]
pub fn mixed_start_batch<B, R>(
    policy: &MixingPolicy,
    sb_iter: usize,
    n: usize,
    p0: &dyn Prior,
    buffer: &mut dyn ReplayBuffer,
    bwd: &B,
    grid: &TimeGrid,
    rng: &mut R,
) -> Result<Array2<f32>>
where
    B: DriftModel + ?Sized,
    R: Rng,
{
    let n_off = policy.off_policy_rows(sb_iter, n);
    if n_off == 0 {
        return Ok(p0.sample(n, rng));
    }
    if buffer.is_empty() {
        debug!(sb_iter, n_off, "replay buffer is empty, using an on-policy start batch");
        return Ok(p0.sample(n, rng));
    }

    let x1 = buffer.sample(n_off)?;
    let x0_off = simulate_last(
        bwd,
        &x1.view(),
        Direction::Backward,
        grid,
        MatchingMethod::Ll,
        rng,
    )?;
    if n_off == n {
        return Ok(x0_off);
    }
    let x0_on = p0.sample(n - n_off, rng);
    ndarray::concatenate(Axis(0), &[x0_off.view(), x0_on.view()])
        .map_err(|_| Error::Shape("off- and on-policy rows must share a dimension"))
}

fn replicate(x: &ArrayView2<f32>, times: usize) -> Result<Array2<f32>> {
    let views: Vec<ArrayView2<f32>> = (0..times).map(|_| x.view()).collect();
    ndarray::concatenate(Axis(0), &views).map_err(|_| Error::Shape("failed to replicate batch"))
}

/// One optimizer step on `model`'s accumulated gradient.
fn apply_gradients<M: TrainableDrift + ?Sized>(
    model: &mut M,
    opt: &mut dyn Optimizer,
    max_grad_norm: Option<f32>,
) {
    let (params, grad) = model.params_and_grad();
    match max_grad_norm {
        Some(max_norm) => {
            let mut clipped = grad.to_owned();
            clip_grad_norm(&mut clipped.view_mut(), max_norm);
            opt.step(params, clipped.view());
        }
        None => opt.step(params, grad),
    }
}

/// Owns both drift models, their optimizers and EMA shadows, the replay buffer and the
/// endpoint distributions, and drives the alternating SB iteration.
pub struct SchrodingerBridge<F, B> {
    config: BridgeConfig,
    grid: TimeGrid,
    fwd: F,
    bwd: B,
    fwd_opt: Box<dyn Optimizer>,
    bwd_opt: Box<dyn Optimizer>,
    fwd_ema: Ema,
    bwd_ema: Ema,
    reference: ReferenceProcess,
    p0: Arc<dyn Prior>,
    p1: Arc<dyn Target>,
    buffer: Box<dyn ReplayBuffer>,
    log_z: Array1<f32>,
    log_z_opt: Adam,
    rng: ChaCha8Rng,
}

impl<F: TrainableDrift, B: TrainableDrift> SchrodingerBridge<F, B> {
    pub fn new(
        fwd: F,
        bwd: B,
        p0: Arc<dyn Prior>,
        p1: Arc<dyn Target>,
        config: BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let grid = config.grid()?;
        let d = p0.dim();
        if p1.dim() != d || fwd.dim() != d || bwd.dim() != d {
            return Err(Error::Shape("p0, p1 and both models must share one state dimension"));
        }

        let fwd_ema = Ema::new(&fwd, config.ema_decay)?;
        let bwd_ema = Ema::new(&bwd, config.ema_decay)?;
        let buffer = build_buffer(&config.buffer, Arc::clone(&p1), config.seed.wrapping_add(1))?;
        let reference = ReferenceProcess::new(d, config.reference.alpha, config.reference.gamma);

        info!(
            dim = d,
            buffer = ?config.buffer.kind,
            n_trajectories = config.n_trajectories,
            n_steps = grid.n_steps(),
            "schrodinger bridge initialised"
        );
        Ok(Self {
            fwd_opt: config.optimizer.build(),
            bwd_opt: config.optimizer.build(),
            log_z_opt: Adam::new(config.log_z_lr),
            log_z: Array1::zeros(1),
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            grid,
            fwd,
            bwd,
            fwd_ema,
            bwd_ema,
            reference,
            p0,
            p1,
            buffer,
        })
    }

    /// Replace the configured buffer, e.g. with a [`crate::buffer::SharedBuffer`] handle.
    pub fn with_buffer(mut self, buffer: Box<dyn ReplayBuffer>) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn grid(&self) -> &TimeGrid {
        &self.grid
    }

    pub fn buffer(&self) -> &dyn ReplayBuffer {
        self.buffer.as_ref()
    }

    pub fn fwd_model(&self) -> &F {
        &self.fwd
    }

    pub fn bwd_model(&self) -> &B {
        &self.bwd
    }

    /// Learned log-normaliser of the single-trajectory loss.
    pub fn log_z(&self) -> f32 {
        self.log_z[0]
    }

    /// `num_bwd_steps` updates of the backward model.
    pub fn train_backward_step(
        &mut self,
        sb_iter: usize,
        sink: &mut dyn MetricsSink,
    ) -> Result<()> {
        let _span = info_span!("backward", sb_iter).entered();
        let cfg = &self.config;
        let n_steps = self.grid.n_steps() as f32;

        let fwd: EmaScope<'_, F> = self.fwd_ema.scope(&mut self.fwd)?;
        for step in 0..cfg.num_bwd_steps {
            let x0 = self.p0.sample(cfg.batch_size, &mut self.rng);
            let loss = if sb_iter == 0 {
                backward_tlm_loss(
                    &self.reference,
                    &mut self.bwd,
                    &x0.view(),
                    &self.grid,
                    cfg.drift_reg_coeff,
                    &mut self.rng,
                )?
            } else {
                backward_tlm_loss(
                    &*fwd,
                    &mut self.bwd,
                    &x0.view(),
                    &self.grid,
                    cfg.drift_reg_coeff,
                    &mut self.rng,
                )?
            };
            apply_gradients(&mut self.bwd, self.bwd_opt.as_mut(), cfg.optimizer.max_grad_norm);
            self.bwd_ema.update(&self.bwd)?;

            debug!(step, loss, "backward step");
            sink.log(&record([
                ("train/backward_loss", loss / n_steps),
                ("bwd_step", (sb_iter * cfg.num_bwd_steps + step) as f32),
            ]));
        }
        Ok(())
    }

    /// `num_fwd_steps` updates of the forward model.
    pub fn train_forward_step(&mut self, sb_iter: usize, sink: &mut dyn MetricsSink) -> Result<()> {
        let _span = info_span!("forward", sb_iter).entered();
        let cfg = &self.config;
        let n_steps = self.grid.n_steps() as f32;
        let n_traj = cfg.n_trajectories;
        let policy = MixingPolicy::from_config(cfg);

        let bwd: EmaScope<'_, B> = self.bwd_ema.scope(&mut self.bwd)?;
        for step in 0..cfg.num_fwd_steps {
            let x0 = mixed_start_batch(
                &policy,
                sb_iter,
                cfg.base_batch_size(),
                self.p0.as_ref(),
                self.buffer.as_mut(),
                &*bwd,
                &self.grid,
                &mut self.rng,
            )?;

            let (loss, mut rec) = if n_traj == 1 {
                let tb = forward_tb_loss(
                    &mut self.fwd,
                    &*bwd,
                    self.p0.as_ref(),
                    self.p1.as_ref(),
                    self.log_z[0],
                    &x0.view(),
                    &self.grid,
                    cfg.drift_reg_coeff,
                    Some(self.buffer.as_mut()),
                    &mut self.rng,
                )?;
                self.log_z_opt.step(self.log_z.view_mut(), array![tb.grad_log_z].view());
                (tb.loss, record([("train/log_z", self.log_z[0])]))
            } else {
                let x0_rep = replicate(&x0.view(), n_traj)?;
                let loss = forward_vargrad_loss(
                    &mut self.fwd,
                    &*bwd,
                    self.p1.as_ref(),
                    &x0_rep.view(),
                    n_traj,
                    &self.grid,
                    cfg.drift_reg_coeff,
                    Some(self.buffer.as_mut()),
                    &mut self.rng,
                )?;
                (loss, Record::new())
            };

            // Monitoring only: fresh samples, no buffer write.
            let x_val = self.p0.sample(cfg.val_batch_size, &mut self.rng);
            let x1 = simulate_last(
                &self.fwd,
                &x_val.view(),
                Direction::Forward,
                &self.grid,
                MatchingMethod::Ll,
                &mut self.rng,
            )?;
            let mean_log_reward = self.p1.log_reward(&x1.view()).mean().unwrap_or(f32::NAN);

            apply_gradients(&mut self.fwd, self.fwd_opt.as_mut(), cfg.optimizer.max_grad_norm);
            self.fwd_ema.update(&self.fwd)?;

            debug!(step, loss, mean_log_reward, buffer_len = self.buffer.len(), "forward step");
            rec.extend(record([
                ("train/forward_loss", loss / n_steps),
                ("metrics/mean_log_reward", mean_log_reward),
                ("fwd_step", (sb_iter * cfg.num_fwd_steps + step) as f32),
            ]));
            sink.log(&rec);
        }
        Ok(())
    }

    /// Likelihood metrics and visual hooks for the current forward model.
    pub fn log_forward_step(
        &mut self,
        sb_iter: usize,
        sink: &mut dyn MetricsSink,
        visualizer: &mut dyn Visualizer,
    ) -> Result<()> {
        let _span = info_span!("evaluate", sb_iter).entered();
        let cfg = &self.config;

        let x0 = self.p0.sample(cfg.val_batch_size, &mut self.rng);
        let est = compute_elbo(
            &self.fwd,
            &self.bwd,
            self.p0.as_ref(),
            self.p1.as_ref(),
            &x0.view(),
            &self.grid,
            cfg.n_eval_trajectories,
            &mut self.rng,
        )?;
        let mut rec = record([
            ("metrics/p1_elbo", est.elbo),
            ("metrics/p1_iw_1", est.iw_1),
            ("metrics/p1_iw_2", est.iw_2),
            ("sb_iter", sb_iter as f32),
        ]);

        match cfg.logging_data {
            LoggingData::Images => {
                let x1_pred = simulate_last(
                    &self.fwd,
                    &x0.view(),
                    Direction::Forward,
                    &self.grid,
                    MatchingMethod::Ll,
                    &mut self.rng,
                )?;
                visualizer.images(sb_iter, &x0.view(), &x1_pred.view());
                if sb_iter > 0 && !self.buffer.is_empty() {
                    let preview = self.buffer.sample(BUFFER_PREVIEW_ROWS)?;
                    visualizer.buffer_images(sb_iter, &preview.view());
                }
            }
            LoggingData::TwoD => {
                let traj = simulate(
                    &self.fwd,
                    &x0.view(),
                    Direction::Forward,
                    &self.grid,
                    cfg.matching_method,
                    &mut self.rng,
                )?;
                visualizer.trajectory(sb_iter, &traj);
                let x1_true = self.p1.sample(cfg.val_batch_size, &mut self.rng);
                let w2 = x1_true.map(|y| {
                    w2_distance(&y.view(), &traj.last().view(), cfg.w2_reg, W2_MAX_ITER, W2_TOL)
                });
                match w2 {
                    Some(Ok(w2)) => {
                        rec.insert("metrics/W2".to_string(), w2);
                    }
                    Some(Err(e)) => debug!(error = %e, "W2 unavailable"),
                    None => debug!("target has no sampler, W2 omitted"),
                }
            }
        }

        info!(elbo = est.elbo, iw_1 = est.iw_1, iw_2 = est.iw_2, "evaluation");
        sink.log(&rec);
        Ok(())
    }

    /// Backward training, forward training, then evaluation.
    pub fn run_iteration(
        &mut self,
        sb_iter: usize,
        sink: &mut dyn MetricsSink,
        visualizer: &mut dyn Visualizer,
    ) -> Result<()> {
        self.train_backward_step(sb_iter, sink)?;
        self.train_forward_step(sb_iter, sink)?;
        self.log_forward_step(sb_iter, sink, visualizer)?;
        info!(sb_iter, buffer_len = self.buffer.len(), "sb iteration done");
        Ok(())
    }

    /// Run `n_iters` SB iterations starting at `sb_iter = 0`.
    pub fn train(
        &mut self,
        n_iters: usize,
        sink: &mut dyn MetricsSink,
        visualizer: &mut dyn Visualizer,
    ) -> Result<()> {
        for sb_iter in 0..n_iters {
            self.run_iteration(sb_iter, sink, visualizer)?;
        }
        Ok(())
    }

    /// Forward-simulate `n` fresh terminal samples. Does not touch the buffer.
    pub fn sample_terminal(&mut self, n: usize) -> Result<Array2<f32>> {
        let x0 = self.p0.sample(n, &mut self.rng);
        simulate_last(
            &self.fwd,
            &x0.view(),
            Direction::Forward,
            &self.grid,
            MatchingMethod::Ll,
            &mut self.rng,
        )
    }
}
