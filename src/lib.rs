//! # sbridge
//!
//! Schrödinger bridge (SB) training as a library primitive.
//!
//! A Schrödinger bridge between two distributions \(p_0\) and \(p_1\) is a pair of
//! stochastic processes: a forward process transporting \(p_0\) samples toward \(p_1\), and a
//! backward process transporting \(p_1\) samples back toward \(p_0\). This crate trains both
//! drifts by alternating optimization over simulated trajectories of a discretised SDE:
//!
//! \[
//! x_{k+1} = x_k + f_\theta(x_k, t_k)\,\Delta t + \sqrt{2\Delta t}\,\varepsilon_k .
//! \]
//!
//! This crate is intentionally small:
//!
//! - it implements the **trajectory simulator**, **replay buffers**, the **losses** and the
//!   **alternating trainer**,
//! - drift models are plugged in through [`model::DriftModel`] / [`model::TrainableDrift`];
//!   the only architecture shipped is the linear baseline in [`linear`],
//! - it does not provide a CLI, checkpoint I/O, or image rendering.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: every stochastic function takes an RNG, and the
//!   trainer seeds its RNGs from `BridgeConfig::seed`.
//! - **Divergence is loud**: a non-finite drift or log-variance during simulation is an
//!   [`Error::Numerical`]; nothing substitutes a default value.
//! - **Replay buffers cache raw terminal states**: refinement (Langevin / HMC) happens only
//!   when sampling from a buffer, never when writing to it.
//! - **Backend-agnostic**: batches are `ndarray::Array2<f32>` with one sample per row.
//!
//! ## Module map
//!
//! - `sampler`: time grid, matching methods, and the trajectory simulator
//! - `buffer`: simple and Langevin-refined replay buffers of terminal states
//! - `losses`: backward trajectory-likelihood loss, forward trajectory-balance / VarGrad losses
//! - `bridge`: the alternating forward/backward trainer (`SchrodingerBridge`)
//! - `metrics`: ELBO / importance-weighted estimators and an entropic W2 distance
//! - `model`, `linear`, `distribution`: the drift and distribution capabilities
//! - `optim`, `ema`: parameter updates and EMA shadowing
//! - `config`, `sink`: run configuration and metrics/visualization hooks

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod distribution;
pub mod ema;
pub mod linear;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod sampler;
pub mod sink;

/// sbridge error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    /// A simulated quantity became non-finite; the process diverged.
    #[error("non-finite {quantity} at simulation step {step}")]
    Numerical { step: usize, quantity: &'static str },
    #[error("replay buffer is empty")]
    EmptyBuffer,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
