//! Replay buffers of terminal states.
//!
//! A buffer caches rows (one sample each) produced by forward simulation so that later forward
//! steps can start from off-policy terminal states. Two kinds exist:
//!
//! - [`SimpleBuffer`]: FIFO with fractional replacement;
//! - [`LangevinBuffer`]: the same cache, but `sample` refines the drawn rows toward `p1`.
//!
//! [`SharedBuffer`] wraps either behind a mutex for use from several trainers.

pub mod langevin;
pub mod simple;

pub use langevin::{ChainSampler, LangevinBuffer, LangevinConfig};
pub use simple::SimpleBuffer;

use crate::distribution::Target;
use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Cache of terminal-state rows.
pub trait ReplayBuffer: Send {
    /// Draw `batch_size` rows. Fails with [`Error::EmptyBuffer`] when nothing is cached.
    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>>;

    /// Insert the rows of `batch`, evicting the oldest rows beyond capacity.
    fn update(&mut self, batch: &ArrayView2<f32>) -> Result<()>;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;
}

impl<B: ReplayBuffer + ?Sized> ReplayBuffer for Box<B> {
    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        (**self).sample(batch_size)
    }

    fn update(&mut self, batch: &ArrayView2<f32>) -> Result<()> {
        (**self).update(batch)
    }

    fn clear(&mut self) {
        (**self).clear()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn capacity(&self) -> usize {
        (**self).capacity()
    }
}

/// Buffer variant, resolved once by [`build_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferKind {
    #[default]
    Simple,
    Langevin,
}

impl FromStr for BufferKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "simple" => Ok(Self::Simple),
            "langevin" => Ok(Self::Langevin),
            other => Err(Error::Config(format!(
                "unknown buffer kind `{other}` (expected one of: simple, langevin)"
            ))),
        }
    }
}

/// Buffer construction parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub kind: BufferKind,
    pub size: usize,
    pub update_fraction: f32,
    /// Only read when `kind == Langevin`.
    pub langevin: LangevinConfig,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            kind: BufferKind::Simple,
            size: 512,
            update_fraction: 1.0,
            langevin: LangevinConfig::default(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::Config("buffer size must be >= 1".into()));
        }
        if !(self.update_fraction > 0.0 && self.update_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "buffer update_fraction must be in (0, 1], got {}",
                self.update_fraction
            )));
        }
        if self.kind == BufferKind::Langevin {
            self.langevin.validate()?;
        }
        Ok(())
    }
}

/// Build the configured buffer. `target` is only used by the Langevin variant.
pub fn build_buffer(
    cfg: &BufferConfig,
    target: Arc<dyn Target>,
    seed: u64,
) -> Result<Box<dyn ReplayBuffer>> {
    cfg.validate()?;
    Ok(match cfg.kind {
        BufferKind::Simple => Box::new(SimpleBuffer::new(cfg.size, cfg.update_fraction, seed)?),
        BufferKind::Langevin => Box::new(LangevinBuffer::new(
            cfg.size,
            cfg.update_fraction,
            target,
            cfg.langevin.clone(),
            seed,
        )?),
    })
}

/// A cloneable, thread-safe handle to one buffer.
///
/// Each operation holds the lock for its whole duration, so a `sample` never observes a
/// half-truncated `update`.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Box<dyn ReplayBuffer>>>,
}

impl SharedBuffer {
    pub fn new(buffer: Box<dyn ReplayBuffer>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn ReplayBuffer>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.lock();
        f.debug_struct("SharedBuffer")
            .field("len", &b.len())
            .field("capacity", &b.capacity())
            .finish()
    }
}

impl ReplayBuffer for SharedBuffer {
    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        self.lock().sample(batch_size)
    }

    fn update(&mut self, batch: &ArrayView2<f32>) -> Result<()> {
        self.lock().update(batch)
    }

    fn clear(&mut self) {
        self.lock().clear()
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}
