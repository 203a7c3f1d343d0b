//! Two-Gaussian Schrödinger bridge demo.
//!
//! Trains linear forward/backward drifts between `N(0, I)` and `N((5, 5), I)` and prints:
//! - per-iteration ELBO / W2 (via the tracing sink)
//! - the mean of the forward trajectory at a few times
//!
//! Pass a JSON config path as the first argument to override the defaults. Set `RUST_LOG=debug`
//! for per-step losses.

use ndarray::{array, Axis};
use sbridge::bridge::SchrodingerBridge;
use sbridge::config::{BridgeConfig, LoggingData};
use sbridge::distribution::{Gaussian, Prior, Target};
use sbridge::linear::LinearDrift;
use sbridge::sampler::Trajectory;
use sbridge::sink::{TracingSink, Visualizer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

struct PrintTrajectory;

impl Visualizer for PrintTrajectory {
    fn trajectory(&mut self, sb_iter: usize, trajectory: &Trajectory) {
        let states = trajectory.states();
        let last = states.len() - 1;
        for k in [0, last / 2, last] {
            if let Some(mean) = states[k].mean_axis(Axis(0)) {
                println!(
                    "iter {sb_iter}  t={:.2}  mean=({:+.3}, {:+.3})",
                    trajectory.timesteps()[k],
                    mean[0],
                    mean[1]
                );
            }
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match std::env::args().nth(1) {
        Some(path) => BridgeConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => {
            let mut cfg = BridgeConfig {
                logging_data: LoggingData::TwoD,
                batch_size: 128,
                n_trajectories: 4,
                num_bwd_steps: 150,
                num_fwd_steps: 150,
                ema_decay: 0.9,
                ..BridgeConfig::default()
            };
            cfg.optimizer.lr = 0.05;
            cfg.buffer.size = 256;
            cfg
        }
    };

    let p0: Arc<dyn Prior> = Arc::new(Gaussian::standard(2)?);
    let p1: Arc<dyn Target> = Arc::new(Gaussian::new(array![5.0f32, 5.0], 1.0)?);
    let (fwd, bwd) = (LinearDrift::new_zeros(2), LinearDrift::new_zeros(2));
    let mut sb = SchrodingerBridge::new(fwd, bwd, p0, p1, cfg)?;

    sb.train(6, &mut TracingSink, &mut PrintTrajectory)?;

    let x1 = sb.sample_terminal(4000)?;
    let mean = x1.mean_axis(Axis(0)).ok_or("empty sample")?;
    let var = x1.var_axis(Axis(0), 1.0);
    println!(
        "terminal mean=({:+.3}, {:+.3})  var=({:.3}, {:.3})",
        mean[0], mean[1], var[0], var[1]
    );
    println!("learned bias={:?}", sb.fwd_model().bias());
    Ok(())
}
