//! Trajectory losses for the two halves of an SB iteration.
//!
//! Both processes are scored with Gaussian transition kernels on a shared time grid
//! (index `k` ↔ time `k·dt`):
//!
//! \[
//! p_F(x_{k+1}\mid x_k) = \mathcal N\big(x_k + f(x_k, k\Delta t)\,\Delta t,\ \sigma^2\big),
//! \qquad
//! p_B(x_k\mid x_{k+1})
//!     = \mathcal N\big(x_{k+1} + b(x_{k+1}, (k+1)\Delta t)\,\Delta t,\ \sigma^2\big),
//! \]
//!
//! with \(\sigma^2 = 2\Delta t\,e^{\ell}\). Trajectories are sampled without gradient tracking;
//! the gradient of each loss flows only through the kernel means at the (fixed) visited states:
//!
//! \[
//! \frac{\partial \log p}{\partial f} = \frac{(x_{\text{target}} - \mu)\,\Delta t}{\sigma^2}.
//! \]
//!
//! A model's optional log-variance head is treated as fixed when differentiating.
//!
//! Every loss **overwrites** the gradient of the model it trains (`zero_grad` first) and leaves
//! the optimizer step to the caller.

use crate::buffer::ReplayBuffer;
use crate::distribution::{Prior, Target};
use crate::model::{DriftModel, TrainableDrift};
use crate::sampler::{simulate, transition, Direction, MatchingMethod, TimeGrid};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;

const LN_2PI: f32 = 1.837_877_1;

/// Per-trajectory path statistics of one process.
#[derive(Debug, Clone)]
pub struct PathStats {
    /// \(\sum_k \log p(\cdot)\) over all transitions, one entry per trajectory.
    pub log_prob: Array1<f32>,
    /// \(\sum_k \lVert f_k \rVert^2 \Delta t\), one entry per trajectory.
    pub drift_sq: Array1<f32>,
}

/// Source state, target state and model evaluation time of transition `k`.
fn kernel_operands<'a>(
    states: &'a [Array2<f32>],
    grid: &TimeGrid,
    kernel: Direction,
    k: usize,
) -> (ArrayView2<'a, f32>, ArrayView2<'a, f32>, f32) {
    let dt = grid.dt();
    match kernel {
        Direction::Forward => (states[k].view(), states[k + 1].view(), k as f32 * dt),
        Direction::Backward => (states[k + 1].view(), states[k].view(), (k + 1) as f32 * dt),
    }
}

fn check_states(states: &[Array2<f32>], grid: &TimeGrid, dim: usize) -> Result<()> {
    if states.len() != grid.n_steps() + 1 {
        return Err(Error::Shape("trajectory must have n_steps + 1 states"));
    }
    let n = states[0].nrows();
    if states.iter().any(|s| s.dim() != (n, dim)) {
        return Err(Error::Shape("trajectory states must share shape (n, model dim)"));
    }
    Ok(())
}

/// Log-probability of time-ordered `states` under `model` used as the `kernel` process.
pub fn path_log_prob<M: DriftModel + ?Sized>(
    model: &M,
    states: &[Array2<f32>],
    grid: &TimeGrid,
    kernel: Direction,
) -> Result<PathStats> {
    check_states(states, grid, model.dim())?;
    let n = states[0].nrows();
    let dt = grid.dt();
    let mut log_prob = Array1::<f32>::zeros(n);
    let mut drift_sq = Array1::<f32>::zeros(n);

    for k in 0..grid.n_steps() {
        let (src, tgt, t) = kernel_operands(states, grid, kernel, k);
        let tr = transition(model, &src, t, dt, k)?;
        for i in 0..n {
            let mut lp = 0.0f32;
            let mut sq = 0.0f32;
            for j in 0..src.ncols() {
                let lv = tr.log_var[[i, j]];
                let r = tgt[[i, j]] - tr.mean[[i, j]];
                lp -= 0.5 * (r * r * (-lv).exp() + lv + LN_2PI);
                sq += tr.drift[[i, j]] * tr.drift[[i, j]];
            }
            log_prob[i] += lp;
            drift_sq[i] += sq * dt;
        }
    }
    Ok(PathStats { log_prob, drift_sq })
}

/// Accumulate the gradient of
/// \(\sum_i c_i \log p(\text{path}_i) + \lambda \sum_i \sum_k \lVert f_k\rVert^2\Delta t\)
/// into `model`, where `coef` holds \(c_i\) and `reg_coef` is \(\lambda\).
pub fn backprop_path_log_prob<M: TrainableDrift + ?Sized>(
    model: &mut M,
    states: &[Array2<f32>],
    grid: &TimeGrid,
    kernel: Direction,
    coef: &ArrayView1<f32>,
    reg_coef: f32,
) -> Result<()> {
    check_states(states, grid, model.dim())?;
    let n = states[0].nrows();
    if coef.len() != n {
        return Err(Error::Shape("one coefficient per trajectory"));
    }
    let dt = grid.dt();

    for k in 0..grid.n_steps() {
        let (src, tgt, t) = kernel_operands(states, grid, kernel, k);
        let tr = transition(&*model, &src, t, dt, k)?;
        let mut g = Array2::<f32>::zeros(src.dim());
        for i in 0..n {
            for j in 0..src.ncols() {
                let inv_var = (-tr.log_var[[i, j]]).exp();
                let dlogp = (tgt[[i, j]] - tr.mean[[i, j]]) * dt * inv_var;
                g[[i, j]] = coef[i] * dlogp + reg_coef * 2.0 * tr.drift[[i, j]] * dt;
            }
        }
        let tv = Array1::<f32>::from_elem(n, t);
        model.accumulate_grad(&src, &tv.view(), &g.view());
    }
    Ok(())
}

/// Backward trajectory-likelihood loss.
///
/// Simulates `x0` forward through `fwd` (the reference process or the shadowed forward model)
/// and maximises the likelihood of the visited path under the backward kernel of `bwd`:
///
/// \[
/// L = -\frac1N\sum_i \sum_k \log p_B(x_k^i \mid x_{k+1}^i)
///     + \lambda\,\frac1N\sum_i\sum_k \lVert b_k^i\rVert^2\Delta t .
/// \]
pub fn backward_tlm_loss<F, B, R>(
    fwd: &F,
    bwd: &mut B,
    x0: &ArrayView2<f32>,
    grid: &TimeGrid,
    drift_reg: f32,
    rng: &mut R,
) -> Result<f32>
where
    F: DriftModel + ?Sized,
    B: TrainableDrift + ?Sized,
    R: Rng + ?Sized,
{
    let n = x0.nrows();
    if n == 0 {
        return Err(Error::Shape("loss batch must be non-empty"));
    }
    let states = simulate(fwd, x0, Direction::Forward, grid, MatchingMethod::Ll, rng)?
        .into_time_ordered();

    let stats = path_log_prob(&*bwd, &states, grid, Direction::Backward)?;
    let inv_n = 1.0 / n as f32;
    let loss = -stats.log_prob.sum() * inv_n + drift_reg * stats.drift_sq.sum() * inv_n;

    bwd.zero_grad();
    let coef = Array1::<f32>::from_elem(n, -inv_n);
    let reg_coef = drift_reg * inv_n;
    backprop_path_log_prob(bwd, &states, grid, Direction::Backward, &coef.view(), reg_coef)?;
    Ok(loss)
}

/// Result of [`forward_tb_loss`].
#[derive(Debug, Clone, Copy)]
pub struct TbLoss {
    pub loss: f32,
    /// \(\partial L / \partial \log Z\).
    pub grad_log_z: f32,
}

/// Forward state of one loss call: the sampled path plus both path log-probabilities.
struct ForwardPaths {
    states: Vec<Array2<f32>>,
    fwd: PathStats,
    bwd: PathStats,
    log_p1: Array1<f32>,
}

fn forward_paths<F, B, R>(
    fwd: &F,
    bwd: &B,
    p1: &dyn Target,
    x0: &ArrayView2<f32>,
    grid: &TimeGrid,
    buffer: Option<&mut dyn ReplayBuffer>,
    rng: &mut R,
) -> Result<ForwardPaths>
where
    F: DriftModel + ?Sized,
    B: DriftModel + ?Sized,
    R: Rng + ?Sized,
{
    if x0.nrows() == 0 {
        return Err(Error::Shape("loss batch must be non-empty"));
    }
    let states = simulate(fwd, x0, Direction::Forward, grid, MatchingMethod::Ll, rng)?
        .into_time_ordered();
    let fwd_stats = path_log_prob(fwd, &states, grid, Direction::Forward)?;
    let bwd_stats = path_log_prob(bwd, &states, grid, Direction::Backward)?;
    let x_n = states[grid.n_steps()].view();
    let log_p1 = p1.log_density(&x_n);
    // Only paths that scored cleanly reach the buffer.
    if let Some(buf) = buffer {
        buf.update(&x_n)?;
    }
    Ok(ForwardPaths {
        states,
        fwd: fwd_stats,
        bwd: bwd_stats,
        log_p1,
    })
}

/// Single-trajectory trajectory-balance loss for the forward model.
///
/// \[
/// \delta_i = \log Z + \log p_0(x_0^i) + \sum_k \log p_F - \log p_1(x_N^i) - \sum_k \log p_B,
/// \qquad L = \frac1N \sum_i \delta_i^2 .
/// \]
///
/// The simulated terminal states are written to `buffer` when one is given.
#[allow(clippy::too_many_arguments)]
pub fn forward_tb_loss<F, B, R>(
    fwd: &mut F,
    bwd: &B,
    p0: &dyn Prior,
    p1: &dyn Target,
    log_z: f32,
    x0: &ArrayView2<f32>,
    grid: &TimeGrid,
    drift_reg: f32,
    buffer: Option<&mut dyn ReplayBuffer>,
    rng: &mut R,
) -> Result<TbLoss>
where
    F: TrainableDrift + ?Sized,
    B: DriftModel + ?Sized,
    R: Rng + ?Sized,
{
    let paths = forward_paths(&*fwd, bwd, p1, x0, grid, buffer, rng)?;
    let n = x0.nrows();
    let inv_n = 1.0 / n as f32;
    let log_p0 = p0.log_density(x0);

    let mut delta = Array1::<f32>::zeros(n);
    for i in 0..n {
        delta[i] = log_z + log_p0[i] + paths.fwd.log_prob[i]
            - paths.log_p1[i]
            - paths.bwd.log_prob[i];
    }
    let loss = delta.mapv(|d| d * d).sum() * inv_n + drift_reg * paths.fwd.drift_sq.sum() * inv_n;
    let coef = delta.mapv(|d| 2.0 * d * inv_n);

    fwd.zero_grad();
    let reg_coef = drift_reg * inv_n;
    backprop_path_log_prob(fwd, &paths.states, grid, Direction::Forward, &coef.view(), reg_coef)?;
    Ok(TbLoss {
        loss,
        grad_log_z: coef.sum(),
    })
}

/// Multi-trajectory VarGrad loss for the forward model.
///
/// Rows of `x0_rep` are `n_trajectories` stacked copies of a base batch of `B` start points, so
/// row `i` belongs to group `i mod B`. With
/// \(\delta_i = \sum_k \log p_F - \log p_1(x_N^i) - \sum_k \log p_B\), the loss is the mean
/// within-group variance \(\frac1N\sum_i (\delta_i - \bar\delta_{g(i)})^2\). The unknown
/// normaliser and \(\log p_0\) are constant within a group and cancel.
///
/// The simulated terminal states are written to `buffer` when one is given.
#[allow(clippy::too_many_arguments)]
pub fn forward_vargrad_loss<F, B, R>(
    fwd: &mut F,
    bwd: &B,
    p1: &dyn Target,
    x0_rep: &ArrayView2<f32>,
    n_trajectories: usize,
    grid: &TimeGrid,
    drift_reg: f32,
    buffer: Option<&mut dyn ReplayBuffer>,
    rng: &mut R,
) -> Result<f32>
where
    F: TrainableDrift + ?Sized,
    B: DriftModel + ?Sized,
    R: Rng + ?Sized,
{
    let n = x0_rep.nrows();
    if n_trajectories == 0 || n % n_trajectories != 0 {
        return Err(Error::Shape("replicated batch must hold n_trajectories copies"));
    }
    let base = n / n_trajectories;
    let paths = forward_paths(&*fwd, bwd, p1, x0_rep, grid, buffer, rng)?;
    let inv_n = 1.0 / n as f32;

    let mut delta = Array1::<f32>::zeros(n);
    let mut group_mean = Array1::<f32>::zeros(base);
    for i in 0..n {
        delta[i] = paths.fwd.log_prob[i] - paths.log_p1[i] - paths.bwd.log_prob[i];
        group_mean[i % base] += delta[i] / n_trajectories as f32;
    }
    let centred = Array1::from_shape_fn(n, |i| delta[i] - group_mean[i % base]);

    let loss = centred.mapv(|c| c * c).sum() * inv_n + drift_reg * paths.fwd.drift_sq.sum() * inv_n;
    // Centred residuals sum to zero per group, so the group-mean term drops out of the gradient.
    let coef = centred.mapv(|c| 2.0 * c * inv_n);

    fwd.zero_grad();
    let reg_coef = drift_reg * inv_n;
    backprop_path_log_prob(fwd, &paths.states, grid, Direction::Forward, &coef.view(), reg_coef)?;
    Ok(loss)
}
