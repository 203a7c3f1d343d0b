use ndarray::{array, Array2, ArrayView2, Axis};
use sbridge::bridge::SchrodingerBridge;
use sbridge::buffer::{ReplayBuffer, SharedBuffer, SimpleBuffer};
use sbridge::config::BridgeConfig;
use sbridge::distribution::{Gaussian, Prior, Target};
use sbridge::linear::LinearDrift;
use sbridge::optim::OptimizerConfig;
use sbridge::sink::{MemorySink, NoVisualizer};
use sbridge::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Records the largest length the wrapped buffer ever reaches.
struct HighWater {
    inner: SimpleBuffer,
    max_len: Arc<AtomicUsize>,
}

impl ReplayBuffer for HighWater {
    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        self.inner.sample(batch_size)
    }

    fn update(&mut self, batch: &ArrayView2<f32>) -> Result<()> {
        self.inner.update(batch)?;
        self.max_len.fetch_max(self.inner.len(), Ordering::SeqCst);
        Ok(())
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

fn toy_config() -> BridgeConfig {
    let mut cfg = BridgeConfig {
        t_max: 1.0,
        n_steps: 20,
        dt: 0.05,
        num_bwd_steps: 150,
        num_fwd_steps: 150,
        batch_size: 128,
        val_batch_size: 64,
        n_trajectories: 4,
        ema_decay: 0.9,
        optimizer: OptimizerConfig {
            lr: 0.05,
            ..OptimizerConfig::default()
        },
        seed: 7,
        ..BridgeConfig::default()
    };
    cfg.reference.alpha = 1.0;
    cfg.buffer.size = 256;
    cfg.buffer.update_fraction = 1.0;
    cfg
}

/// Two Gaussians, a linear reference process and a 256-row simple buffer: the forward process
/// must learn to transport `N(0, I)` onto `N((5, 5), I)` without the buffer ever overflowing.
#[test]
fn gaussian_bridge_transports_p0_onto_p1() -> Result<()> {
    let p0: Arc<dyn Prior> = Arc::new(Gaussian::standard(2)?);
    let p1: Arc<dyn Target> = Arc::new(Gaussian::new(array![5.0f32, 5.0], 1.0)?);
    let cfg = toy_config();

    let max_len = Arc::new(AtomicUsize::new(0));
    let shared = SharedBuffer::new(Box::new(HighWater {
        inner: SimpleBuffer::new(cfg.buffer.size, cfg.buffer.update_fraction, 11)?,
        max_len: Arc::clone(&max_len),
    }));

    let (fwd, bwd) = (LinearDrift::new_zeros(2), LinearDrift::new_zeros(2));
    let mut sb =
        SchrodingerBridge::new(fwd, bwd, p0, p1, cfg)?.with_buffer(Box::new(shared.clone()));
    let mut sink = MemorySink::default();
    let mut vis = NoVisualizer;

    for sb_iter in 0..4 {
        sb.run_iteration(sb_iter, &mut sink, &mut vis)?;
        assert!(shared.len() <= 256, "buffer holds {} rows", shared.len());
    }
    assert!(max_len.load(Ordering::SeqCst) <= 256);
    assert_eq!(shared.len(), 256);

    let x1 = sb.sample_terminal(2000)?;
    let mean = x1.mean_axis(Axis(0)).expect("non-empty sample");
    for k in 0..2 {
        assert!((mean[k] - 5.0).abs() < 1.0, "terminal mean {mean:?}");
    }

    let losses = sink.series("train/forward_loss");
    assert_eq!(losses.len(), 4 * 150);
    assert!(losses.iter().all(|l| l.is_finite()));
    assert!(sink.series("metrics/p1_elbo").iter().all(|v| v.is_finite()));
    Ok(())
}

/// Same scenario, but off-policy starts come exclusively from a Langevin-refined buffer.
#[test]
fn langevin_buffer_feeds_off_policy_training() -> Result<()> {
    let p0: Arc<dyn Prior> = Arc::new(Gaussian::standard(2)?);
    let p1: Arc<dyn Target> = Arc::new(Gaussian::new(array![5.0f32, 5.0], 1.0)?);
    let mut cfg = toy_config();
    cfg.num_bwd_steps = 40;
    cfg.num_fwd_steps = 40;
    cfg.off_policy_fraction = 1.0;
    cfg.buffer.kind = "langevin".parse()?;
    cfg.buffer.langevin.num_steps = 10;

    let (fwd, bwd) = (LinearDrift::new_zeros(2), LinearDrift::new_zeros(2));
    let mut sb = SchrodingerBridge::new(fwd, bwd, p0, p1, cfg)?;
    let mut sink = MemorySink::default();
    sb.train(2, &mut sink, &mut NoVisualizer)?;

    assert!(sb.buffer().len() <= 256);
    assert_eq!(sink.series("fwd_step").len(), 80);
    assert!(sink.series("train/forward_loss").iter().all(|l| l.is_finite()));
    Ok(())
}
