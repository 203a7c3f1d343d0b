//! Evaluation metrics for a trained bridge (small + explicit).
//!
//! - ELBO and importance-weighted bounds on \(\log p_1\) at the forward model's samples,
//!   computed from the forward/backward path log-probabilities;
//! - an entropic approximation of the 2-Wasserstein distance between two sample sets, for
//!   targets with a tractable sampler.
//!
//! None of these feed gradients back into training.

use crate::distribution::{Prior, Target};
use crate::losses::path_log_prob;
use crate::model::DriftModel;
use crate::sampler::{simulate, Direction, MatchingMethod, TimeGrid};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;

/// Numerically stable \(\log \frac1n \sum_i e^{x_i}\). Returns `-∞` for an empty slice.
pub fn log_mean_exp(xs: &[f32]) -> f32 {
    if xs.is_empty() {
        return f32::NEG_INFINITY;
    }
    let m = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !m.is_finite() {
        return m;
    }
    let s: f64 = xs.iter().map(|&x| ((x - m) as f64).exp()).sum();
    (m as f64 + (s / xs.len() as f64).ln()) as f32
}

/// Likelihood estimates for the forward process' terminal distribution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElboEstimate {
    /// Mean log-weight over all trajectories.
    pub elbo: f32,
    /// Per-start-point importance-weighted bound, averaged over start points.
    pub iw_1: f32,
    /// Importance-weighted bound pooled over every trajectory.
    pub iw_2: f32,
}

/// Estimate the ELBO and importance-weighted bounds with `n_traj` trajectories per start point.
///
/// For each trajectory,
/// \[
/// \log w = \log p_1(x_N) + \sum_k \log p_B - \sum_k \log p_F - \log p_0(x_0).
/// \]
/// By Jensen, `elbo <= iw_1 <= iw_2`.
#[allow(clippy::too_many_arguments)]
pub fn compute_elbo<F, B, R>(
    fwd: &F,
    bwd: &B,
    p0: &dyn Prior,
    p1: &dyn Target,
    x0: &ArrayView2<f32>,
    grid: &TimeGrid,
    n_traj: usize,
    rng: &mut R,
) -> Result<ElboEstimate>
where
    F: DriftModel + ?Sized,
    B: DriftModel + ?Sized,
    R: Rng + ?Sized,
{
    let base = x0.nrows();
    if base == 0 {
        return Err(Error::Domain("x0 must be non-empty"));
    }
    if n_traj == 0 {
        return Err(Error::Domain("n_traj must be >= 1"));
    }

    let views: Vec<ArrayView2<f32>> = (0..n_traj).map(|_| x0.view()).collect();
    let x_rep = ndarray::concatenate(Axis(0), &views)
        .map_err(|_| Error::Shape("failed to replicate start batch"))?;
    let states = simulate(fwd, &x_rep.view(), Direction::Forward, grid, MatchingMethod::Ll, rng)?
        .into_time_ordered();

    let lp_f = path_log_prob(fwd, &states, grid, Direction::Forward)?.log_prob;
    let lp_b = path_log_prob(bwd, &states, grid, Direction::Backward)?.log_prob;
    let lp_0 = p0.log_density(&x_rep.view());
    let lp_1 = p1.log_density(&states[grid.n_steps()].view());
    let log_w: Array1<f32> = &lp_1 + &lp_b - &lp_f - &lp_0;

    let elbo = log_w.mean().unwrap_or(f32::NEG_INFINITY);
    let mut iw_1 = 0.0f32;
    let mut group = Vec::with_capacity(n_traj);
    for b in 0..base {
        group.clear();
        group.extend((0..n_traj).map(|r| log_w[r * base + b]));
        iw_1 += log_mean_exp(&group);
    }
    iw_1 /= base as f32;
    let iw_2 = log_mean_exp(&log_w.to_vec());

    Ok(ElboEstimate { elbo, iw_1, iw_2 })
}

/// Entropic 2-Wasserstein distance between two uniform empirical measures.
///
/// Runs `wass`'s log-domain Sinkhorn on the squared-Euclidean cost and returns
/// \(\sqrt{\langle C, P\rangle}\) for the entropic plan `P`. `reg` is relative: the entropic
/// temperature is `reg * mean(C)`, so the same value works across data scales.
///
/// Fails with [`Error::Domain`] if the largest marginal error is not below `tol` after
/// `max_iter` iterations. The result is an upper-biased approximation of the exact W2.
pub fn w2_distance(
    x: &ArrayView2<f32>,
    y: &ArrayView2<f32>,
    reg: f32,
    max_iter: usize,
    tol: f32,
) -> Result<f32> {
    let (m, n) = (x.nrows(), y.nrows());
    if m == 0 || n == 0 || x.ncols() == 0 {
        return Err(Error::Domain("x and y must be non-empty"));
    }
    if x.ncols() != y.ncols() {
        return Err(Error::Shape("x and y must have the same dimension"));
    }
    if !reg.is_finite() || reg <= 0.0 {
        return Err(Error::Domain("reg must be positive and finite"));
    }
    if max_iter == 0 {
        return Err(Error::Domain("max_iter must be >= 1"));
    }
    if !tol.is_finite() || tol <= 0.0 {
        return Err(Error::Domain("tol must be positive and finite"));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(Error::Domain("x and y must be finite"));
    }

    let cost: Array2<f32> = wass::sq_euclidean_cost_matrix(&x.to_owned(), &y.to_owned());
    let scale = cost.mean().unwrap_or(0.0);
    if scale <= 0.0 {
        return Ok(0.0);
    }
    let a = Array1::<f32>::from_elem(m, 1.0 / m as f32);
    let b = Array1::<f32>::from_elem(n, 1.0 / n as f32);
    let (_plan, dist, _iters) =
        wass::sinkhorn_log_with_convergence(&a, &b, &cost, reg * scale, max_iter, tol)
            .map_err(|_| Error::Domain("sinkhorn did not converge"))?;
    Ok(dist.max(0.0).sqrt())
}
