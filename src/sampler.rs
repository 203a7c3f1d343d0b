//! Discretised SDE trajectory simulator.
//!
//! One step of the forward process is
//! \[
//! x_{k+1} = x_k + f(x_k, t_k)\,\Delta t + \sigma_k \varepsilon_k,\qquad
//! \log\sigma_k^2 = \log(2\Delta t) + \ell_k,
//! \]
//! where \(\ell_k\) is an optional model-supplied log-variance correction. The backward
//! process uses the same kernel with time running from `t_max` down to `dt`.
//!
//! Like the ODE integrators this grew out of, the simulator is fixed-step and explicit: no
//! adaptive stepping, no hidden tolerances. It is a pure function of the model, the start batch,
//! the grid and the RNG.

use crate::model::DriftModel;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Zip};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Diffusion coefficient used by [`MatchingMethod::Sde`] steps.
pub const SDE_DIFFUSION: f32 = 1.42;

/// Which way a trajectory runs in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `0 → t_max`.
    Forward,
    /// `t_max → 0`.
    Backward,
}

/// How a model output is turned into the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchingMethod {
    /// The model predicts the next-state mean (log-likelihood parameterization).
    #[default]
    Ll,
    /// Same update as `Ll` (denoising-style parameterization).
    Mean,
    /// The model predicts an additive correction: `x_new = x + mean + noise`.
    Score,
    /// Euler-Maruyama step with diffusion [`SDE_DIFFUSION`] and a direction-dependent sign.
    Sde,
}

impl FromStr for MatchingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ll" => Ok(Self::Ll),
            "mean" => Ok(Self::Mean),
            "score" => Ok(Self::Score),
            "sde" => Ok(Self::Sde),
            other => Err(Error::Config(format!(
                "unknown matching method `{other}` (expected one of: ll, mean, score, sde)"
            ))),
        }
    }
}

/// Evenly spaced time grid over `[0, t_max]` with `n_steps` intervals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeGrid {
    dt: f32,
    t_max: f32,
    n_steps: usize,
}

impl TimeGrid {
    /// Derive `dt = t_max / n_steps`.
    pub fn new(t_max: f32, n_steps: usize) -> Result<Self> {
        if n_steps == 0 {
            return Err(Error::Domain("n_steps must be >= 1"));
        }
        if !(t_max > 0.0) || !t_max.is_finite() {
            return Err(Error::Domain("t_max must be positive and finite"));
        }
        Ok(Self {
            dt: t_max / n_steps as f32,
            t_max,
            n_steps,
        })
    }

    /// Use a caller-supplied `dt`, which must agree with `t_max / n_steps`.
    pub fn with_dt(dt: f32, n_steps: usize, t_max: f32) -> Result<Self> {
        let grid = Self::new(t_max, n_steps)?;
        if !(dt > 0.0) || !dt.is_finite() {
            return Err(Error::Domain("dt must be positive and finite"));
        }
        if (dt * n_steps as f32 - t_max).abs() > 1e-4 * t_max.max(1.0) {
            return Err(Error::Domain("dt * n_steps must equal t_max"));
        }
        Ok(Self { dt, ..grid })
    }

    #[inline]
    pub fn dt(&self) -> f32 {
        self.dt
    }

    #[inline]
    pub fn t_max(&self) -> f32 {
        self.t_max
    }

    #[inline]
    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    /// Time at which the model is evaluated on step `k` (0-based).
    #[inline]
    pub fn eval_time(&self, direction: Direction, k: usize) -> f32 {
        match direction {
            Direction::Forward => k as f32 * self.dt,
            Direction::Backward => self.t_max - k as f32 * self.dt,
        }
    }

    /// Time label of the state reached after step `k`.
    #[inline]
    pub fn label(&self, direction: Direction, k: usize) -> f32 {
        match direction {
            Direction::Forward => (k + 1) as f32 * self.dt,
            Direction::Backward => self.t_max - (k + 1) as f32 * self.dt,
        }
    }

    #[inline]
    pub fn start_label(&self, direction: Direction) -> f32 {
        match direction {
            Direction::Forward => 0.0,
            Direction::Backward => self.t_max,
        }
    }
}

/// One simulated run: `n_steps + 1` states and their time labels, in simulation order.
#[derive(Debug, Clone)]
pub struct Trajectory {
    direction: Direction,
    states: Vec<Array2<f32>>,
    timesteps: Vec<f32>,
}

impl Trajectory {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn states(&self) -> &[Array2<f32>] {
        &self.states
    }

    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    /// Number of states (`n_steps + 1`).
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn first(&self) -> &Array2<f32> {
        &self.states[0]
    }

    /// The terminal state.
    pub fn last(&self) -> &Array2<f32> {
        &self.states[self.states.len() - 1]
    }

    pub fn into_last(mut self) -> Array2<f32> {
        // `simulate` always produces at least the start state.
        self.states.swap_remove(self.states.len() - 1)
    }

    pub fn into_states(self) -> Vec<Array2<f32>> {
        self.states
    }

    /// States ordered by increasing time (index `k` ↔ time `k·dt`).
    pub fn into_time_ordered(self) -> Vec<Array2<f32>> {
        let mut states = self.states;
        if self.direction == Direction::Backward {
            states.reverse();
        }
        states
    }
}

/// Mean and log-variance of one transition kernel.
#[derive(Debug, Clone)]
pub struct Transition {
    pub drift: Array2<f32>,
    /// `x + drift * dt`.
    pub mean: Array2<f32>,
    /// `ln(2 dt)`, plus the model correction when present.
    pub log_var: Array2<f32>,
}

/// Evaluate `model` at `(x, t)` and build the Gaussian transition kernel.
///
/// Fails with [`Error::Numerical`] (tagged with `step`) if the drift is non-finite or the
/// log-variance is NaN / `+∞`. A log-variance of `−∞` is accepted and means "no noise".
pub fn transition<M: DriftModel + ?Sized>(
    model: &M,
    x: &ArrayView2<f32>,
    t: f32,
    dt: f32,
    step: usize,
) -> Result<Transition> {
    let tv = Array1::<f32>::from_elem(x.nrows(), t);
    let out = model.evaluate(x, &tv.view());
    if out.drift.dim() != x.dim() {
        return Err(Error::Shape("model drift must have the same shape as its input"));
    }
    if out.drift.iter().any(|v| !v.is_finite()) {
        return Err(Error::Numerical {
            step,
            quantity: "drift",
        });
    }

    let base = (2.0 * dt).ln();
    let log_var = match out.log_var {
        Some(lv) => {
            if lv.dim() != x.dim() {
                return Err(Error::Shape("model log_var must have the same shape as its input"));
            }
            if lv.iter().any(|v| v.is_nan() || *v == f32::INFINITY) {
                return Err(Error::Numerical {
                    step,
                    quantity: "log_var",
                });
            }
            lv.mapv(|v| base + v)
        }
        None => Array2::from_elem(x.dim(), base),
    };

    let mut mean = x.to_owned();
    mean.scaled_add(dt, &out.drift);

    Ok(Transition {
        drift: out.drift,
        mean,
        log_var,
    })
}

fn standard_normal_like<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    let mut eps = Array2::<f32>::zeros(shape);
    for v in eps.iter_mut() {
        *v = StandardNormal.sample(rng);
    }
    eps
}

/// Draw the next state from a transition according to `method`.
fn next_state<R: Rng + ?Sized>(
    x: &ArrayView2<f32>,
    tr: &Transition,
    direction: Direction,
    dt: f32,
    method: MatchingMethod,
    rng: &mut R,
) -> Array2<f32> {
    let eps = standard_normal_like(x.dim(), rng);
    let mut out = Array2::<f32>::zeros(x.dim());
    match method {
        MatchingMethod::Ll | MatchingMethod::Mean => {
            Zip::from(&mut out)
                .and(&tr.mean)
                .and(&tr.log_var)
                .and(&eps)
                .for_each(|o, &m, &lv, &e| *o = m + (0.5 * lv).exp() * e);
        }
        MatchingMethod::Score => {
            Zip::from(&mut out)
                .and(x)
                .and(&tr.mean)
                .and(&tr.log_var)
                .and(&eps)
                .for_each(|o, &xi, &m, &lv, &e| *o = xi + m + (0.5 * lv).exp() * e);
        }
        MatchingMethod::Sde => {
            // noise_std * g / sqrt(2) == g * sqrt(dt) * exp(model_log_var / 2)
            let scale = SDE_DIFFUSION / core::f32::consts::SQRT_2;
            let sign = match direction {
                Direction::Forward => 1.0f32,
                Direction::Backward => -1.0f32,
            };
            Zip::from(&mut out)
                .and(x)
                .and(&tr.drift)
                .and(&tr.log_var)
                .and(&eps)
                .for_each(|o, &xi, &f, &lv, &e| {
                    *o = xi + sign * f * dt + scale * (0.5 * lv).exp() * e;
                });
        }
    }
    out
}

/// Simulate `grid.n_steps()` steps of `model` from `x_start`.
///
/// - forward: the model is evaluated at `t = 0, dt, …, t_max − dt`;
/// - backward: at `t = t_max, t_max − dt, …, dt`.
///
/// The returned trajectory always has `n_steps + 1` states. No gradient is tracked: losses
/// re-evaluate the models at the returned (fixed) states.
pub fn simulate<M: DriftModel + ?Sized, R: Rng + ?Sized>(
    model: &M,
    x_start: &ArrayView2<f32>,
    direction: Direction,
    grid: &TimeGrid,
    method: MatchingMethod,
    rng: &mut R,
) -> Result<Trajectory> {
    if x_start.ncols() != model.dim() {
        return Err(Error::Shape("start batch dimension must match the model"));
    }
    let n_steps = grid.n_steps();
    let dt = grid.dt();

    let mut states: Vec<Array2<f32>> = Vec::with_capacity(n_steps + 1);
    let mut timesteps: Vec<f32> = Vec::with_capacity(n_steps + 1);
    states.push(x_start.to_owned());
    timesteps.push(grid.start_label(direction));

    for k in 0..n_steps {
        let x = states[k].view();
        let tr = transition(model, &x, grid.eval_time(direction, k), dt, k)?;
        let x_new = next_state(&x, &tr, direction, dt, method, rng);
        states.push(x_new);
        timesteps.push(grid.label(direction, k));
    }

    Ok(Trajectory {
        direction,
        states,
        timesteps,
    })
}

/// Like [`simulate`], but only returns the terminal state.
pub fn simulate_last<M: DriftModel + ?Sized, R: Rng + ?Sized>(
    model: &M,
    x_start: &ArrayView2<f32>,
    direction: Direction,
    grid: &TimeGrid,
    method: MatchingMethod,
    rng: &mut R,
) -> Result<Array2<f32>> {
    Ok(simulate(model, x_start, direction, grid, method, rng)?.into_last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Direction::{Backward, Forward};
    use super::MatchingMethod::{Ll, Mean, Score, Sde};
    use crate::model::{ModelOutput, ReferenceProcess};
    use ndarray::{array, ArrayView1};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Constant drift with an optional constant log-variance correction.
    struct Constant {
        drift: Vec<f32>,
        log_var: Option<f32>,
    }

    impl DriftModel for Constant {
        fn dim(&self) -> usize {
            self.drift.len()
        }

        fn evaluate(&self, x: &ArrayView2<f32>, _t: &ArrayView1<f32>) -> ModelOutput {
            let mut drift = Array2::<f32>::zeros(x.dim());
            for mut row in drift.rows_mut() {
                for k in 0..row.len() {
                    row[k] = self.drift[k];
                }
            }
            ModelOutput {
                drift,
                log_var: self.log_var.map(|lv| Array2::from_elem(x.dim(), lv)),
            }
        }
    }

    /// Returns a NaN drift once `t` crosses `threshold` (in the given direction).
    struct BlowsUp {
        threshold: f32,
        forward: bool,
        quantity: &'static str,
    }

    impl DriftModel for BlowsUp {
        fn dim(&self) -> usize {
            1
        }

        fn evaluate(&self, x: &ArrayView2<f32>, t: &ArrayView1<f32>) -> ModelOutput {
            let crossed = if self.forward {
                t[0] > self.threshold
            } else {
                t[0] < self.threshold
            };
            let bad = if crossed { f32::NAN } else { 0.0 };
            match self.quantity {
                "drift" => ModelOutput::drift_only(Array2::from_elem(x.dim(), bad)),
                _ => ModelOutput {
                    drift: Array2::zeros(x.dim()),
                    log_var: Some(Array2::from_elem(x.dim(), bad)),
                },
            }
        }
    }

    fn method_from_index(i: usize) -> MatchingMethod {
        [
            Ll,
            Mean,
            Score,
            Sde,
        ][i % 4]
    }

    #[test]
    fn grid_rejects_inconsistent_dt() {
        assert!(TimeGrid::with_dt(0.05, 20, 1.0).is_ok());
        assert!(TimeGrid::with_dt(0.1, 20, 1.0).is_err());
        assert!(TimeGrid::new(1.0, 0).is_err());
        assert!(TimeGrid::new(0.0, 10).is_err());
    }

    #[test]
    fn timestep_labels_follow_direction() {
        let grid = TimeGrid::new(1.0, 4).unwrap();
        let x0 = array![[0.0f32, 0.0]];
        let model = ReferenceProcess::linear(2, 1.0);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let fwd = simulate(&model, &x0.view(), Forward, &grid, Ll, &mut rng).unwrap();
        let bwd = simulate(&model, &x0.view(), Backward, &grid, Ll, &mut rng).unwrap();

        let expect_fwd = [0.0f32, 0.25, 0.5, 0.75, 1.0];
        let expect_bwd = [1.0f32, 0.75, 0.5, 0.25, 0.0];
        for k in 0..5 {
            assert!((fwd.timesteps()[k] - expect_fwd[k]).abs() < 1e-6);
            assert!((bwd.timesteps()[k] - expect_bwd[k]).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_noise_reduces_to_the_mean_update() {
        let grid = TimeGrid::new(1.0, 5).unwrap();
        let x0 = array![[1.0f32, -1.0], [0.5, 2.0]];
        let model = Constant {
            drift: vec![2.0, -4.0],
            log_var: Some(f32::NEG_INFINITY),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let dt = grid.dt();

        for method in [Ll, Mean] {
            let traj = simulate(&model, &x0.view(), Forward, &grid, method, &mut rng).unwrap();
            for k in 0..grid.n_steps() {
                let x = &traj.states()[k];
                let x_next = &traj.states()[k + 1];
                // x_new = mean = x + drift * dt
                assert!((x_next[[0, 0]] - (x[[0, 0]] + 2.0 * dt)).abs() < 1e-6);
                assert!((x_next[[1, 1]] - (x[[1, 1]] - 4.0 * dt)).abs() < 1e-6);
            }
        }

        let traj = simulate(&model, &x0.view(), Forward, &grid, Score, &mut rng).unwrap();
        for k in 0..grid.n_steps() {
            let x = &traj.states()[k];
            let x_next = &traj.states()[k + 1];
            // x_new = x + mean = 2x + drift * dt
            assert!((x_next[[0, 1]] - (2.0 * x[[0, 1]] - 4.0 * dt)).abs() < 1e-4);
        }
    }

    #[test]
    fn sde_step_flips_the_drift_sign_backward() {
        let grid = TimeGrid::new(1.0, 10).unwrap();
        let x0 = array![[0.0f32]];
        let model = Constant {
            drift: vec![1.0],
            log_var: Some(f32::NEG_INFINITY),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let fwd = simulate_last(&model, &x0.view(), Forward, &grid, Sde, &mut rng).unwrap();
        let bwd = simulate_last(&model, &x0.view(), Backward, &grid, Sde, &mut rng).unwrap();
        assert!((fwd[[0, 0]] - 1.0).abs() < 1e-5);
        assert!((bwd[[0, 0]] + 1.0).abs() < 1e-5);
    }

    #[test]
    fn nan_drift_fails_on_the_step_where_it_appears() {
        // dt = 0.1: forward evaluates at t = 0.0, 0.1, ...; first t > 0.45 is step 5.
        let grid = TimeGrid::new(1.0, 10).unwrap();
        let x0 = array![[0.0f32]];
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let model = BlowsUp {
            threshold: 0.45,
            forward: true,
            quantity: "drift",
        };
        match simulate(&model, &x0.view(), Forward, &grid, Ll, &mut rng) {
            Err(Error::Numerical { step, quantity }) => {
                assert_eq!(step, 5);
                assert_eq!(quantity, "drift");
            }
            other => panic!("expected a numerical error, got {other:?}"),
        }

        // Backward evaluates at t = 1.0, 0.9, ...; first t < 0.75 is step 3 (t = 0.7).
        let model = BlowsUp {
            threshold: 0.75,
            forward: false,
            quantity: "log_var",
        };
        match simulate(&model, &x0.view(), Backward, &grid, Ll, &mut rng) {
            Err(Error::Numerical { step, quantity }) => {
                assert_eq!(step, 3);
                assert_eq!(quantity, "log_var");
            }
            other => panic!("expected a numerical error, got {other:?}"),
        }
    }

    #[test]
    fn infinite_drift_is_rejected() {
        let grid = TimeGrid::new(1.0, 3).unwrap();
        let model = Constant {
            drift: vec![f32::INFINITY],
            log_var: None,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let res = simulate(&model, &array![[0.0f32]].view(), Forward, &grid, Ll, &mut rng);
        assert!(matches!(res, Err(Error::Numerical { step: 0, .. })));
    }

    #[test]
    fn same_seed_same_trajectory() {
        let grid = TimeGrid::new(1.0, 8).unwrap();
        let model = ReferenceProcess::linear(2, 1.0);
        let x0 = array![[1.0f32, 2.0], [3.0, 4.0]];
        let run = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            simulate_last(&model, &x0.view(), Forward, &grid, Ll, &mut rng).unwrap()
        };
        let (a, b) = (run(9), run(9));
        assert_eq!(a, b);
    }

    #[test]
    fn method_names_parse() {
        assert_eq!("sde".parse::<MatchingMethod>().unwrap(), Sde);
        assert!(matches!("euler".parse::<MatchingMethod>(), Err(Error::Config(_))));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_trajectory_has_n_plus_one_states(
            n_steps in 1usize..40,
            t_max in 0.1f32..3.0f32,
            batch in 1usize..6,
            method_idx in 0usize..4,
            seed in any::<u64>(),
        ) {
            let grid = TimeGrid::new(t_max, n_steps).unwrap();
            let model = ReferenceProcess::linear(2, 0.5);
            let method = method_from_index(method_idx);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let x0 = Array2::<f32>::zeros((batch, 2));

            let fwd = simulate(&model, &x0.view(), Forward, &grid, method, &mut rng).unwrap();
            prop_assert_eq!(fwd.len(), n_steps + 1);
            prop_assert_eq!(fwd.timesteps().len(), n_steps + 1);
            prop_assert!(fwd.states().iter().all(|s| s.dim() == (batch, 2)));

            // Retrace from the terminal state with the same grid: same number of steps and labels.
            let bwd = simulate(&model, &fwd.last().view(), Backward, &grid, method, &mut rng).unwrap();
            prop_assert_eq!(bwd.len(), fwd.len());
            prop_assert_eq!(bwd.timesteps().len(), fwd.timesteps().len());
            prop_assert!((bwd.timesteps()[n_steps]).abs() <= 1e-4 * t_max.max(1.0));
        }
    }
}
