//! Fixed-capacity FIFO buffer with fractional replacement.

use super::ReplayBuffer;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::VecDeque;

/// Cache of terminal-state rows.
///
/// - `update` keeps each incoming row with probability `update_fraction`, appends the kept rows
///   and evicts the oldest ones so that at most `size` remain;
/// - `sample` draws rows uniformly **with replacement**.
#[derive(Debug, Clone)]
pub struct SimpleBuffer {
    size: usize,
    update_fraction: f32,
    dim: Option<usize>,
    rows: VecDeque<Array1<f32>>,
    rng: ChaCha8Rng,
}

impl SimpleBuffer {
    pub fn new(size: usize, update_fraction: f32, seed: u64) -> Result<Self> {
        if size == 0 {
            return Err(Error::Domain("buffer size must be >= 1"));
        }
        if !(update_fraction > 0.0 && update_fraction <= 1.0) {
            return Err(Error::Domain("update_fraction must be in (0, 1]"));
        }
        Ok(Self {
            size,
            update_fraction,
            dim: None,
            rows: VecDeque::with_capacity(size),
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn update_fraction(&self) -> f32 {
        self.update_fraction
    }

    /// Row dimension, fixed by the first non-empty `update`.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    /// Cached rows, oldest first.
    pub fn rows(&self) -> impl Iterator<Item = &Array1<f32>> {
        self.rows.iter()
    }

    /// Draw `k` rows with a caller-provided RNG. Caller guarantees the buffer is non-empty.
    pub(crate) fn draw_with<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Array2<f32> {
        draw_rows(&self.rows, self.dim.unwrap_or(0), k, rng)
    }
}

fn draw_rows<R: Rng + ?Sized>(
    rows: &VecDeque<Array1<f32>>,
    d: usize,
    k: usize,
    rng: &mut R,
) -> Array2<f32> {
    let n = rows.len();
    let mut out = Array2::<f32>::zeros((k, d));
    for i in 0..k {
        let j = rng.random_range(0..n);
        out.row_mut(i).assign(&rows[j]);
    }
    out
}

impl ReplayBuffer for SimpleBuffer {
    fn sample(&mut self, batch_size: usize) -> Result<Array2<f32>> {
        if self.rows.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        let d = self.dim.unwrap_or(0);
        Ok(draw_rows(&self.rows, d, batch_size, &mut self.rng))
    }

    fn update(&mut self, batch: &ArrayView2<f32>) -> Result<()> {
        if batch.nrows() == 0 {
            return Ok(());
        }
        match self.dim {
            Some(d) if d != batch.ncols() => {
                return Err(Error::Shape("batch dimension does not match cached rows"));
            }
            _ => self.dim = Some(batch.ncols()),
        }

        for row in batch.rows() {
            if self.update_fraction < 1.0 && self.rng.random::<f32>() >= self.update_fraction {
                continue;
            }
            self.rows.push_back(row.to_owned());
            if self.rows.len() > self.size {
                self.rows.pop_front();
            }
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.rows.clear();
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn capacity(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn marked(values: &[f32]) -> Array2<f32> {
        let mut out = Array2::<f32>::zeros((values.len(), 2));
        for (i, v) in values.iter().enumerate() {
            out[[i, 0]] = *v;
            out[[i, 1]] = -*v;
        }
        out
    }

    fn first_column(buf: &SimpleBuffer) -> Vec<f32> {
        buf.rows().map(|r| r[0]).collect()
    }

    #[test]
    fn fifo_eviction_keeps_most_recent_rows() {
        let mut buf = SimpleBuffer::new(4, 1.0, 0).unwrap();
        buf.update(&marked(&[1.0, 2.0, 3.0, 4.0]).view()).unwrap();
        buf.update(&marked(&[5.0, 6.0]).view()).unwrap();
        assert_eq!(first_column(&buf), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn oversized_update_keeps_only_the_tail() {
        let mut buf = SimpleBuffer::new(3, 1.0, 0).unwrap();
        buf.update(&marked(&[1.0, 2.0, 3.0, 4.0, 5.0]).view()).unwrap();
        assert_eq!(first_column(&buf), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn empty_buffer_refuses_to_sample() {
        let mut buf = SimpleBuffer::new(4, 1.0, 0).unwrap();
        assert!(buf.is_empty());
        assert!(matches!(buf.sample(3), Err(Error::EmptyBuffer)));
        buf.update(&marked(&[1.0]).view()).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert!(matches!(buf.sample(1), Err(Error::EmptyBuffer)));
    }

    #[test]
    fn dimension_is_fixed_by_first_update() {
        let mut buf = SimpleBuffer::new(4, 1.0, 0).unwrap();
        buf.update(&array![[1.0f32, 2.0]].view()).unwrap();
        assert!(matches!(
            buf.update(&array![[1.0f32, 2.0, 3.0]].view()),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn fractional_update_keeps_roughly_the_fraction() {
        let mut buf = SimpleBuffer::new(10_000, 0.25, 11).unwrap();
        let batch = Array2::<f32>::zeros((4000, 1));
        buf.update(&batch.view()).unwrap();
        let kept = buf.len() as f32 / 4000.0;
        assert!((kept - 0.25).abs() < 0.04, "kept fraction {kept}");
    }

    #[test]
    fn rejects_bad_construction() {
        assert!(SimpleBuffer::new(0, 1.0, 0).is_err());
        assert!(SimpleBuffer::new(4, 0.0, 0).is_err());
        assert!(SimpleBuffer::new(4, 1.5, 0).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_capacity_and_recency_invariants(
            size in 1usize..32,
            batches in prop::collection::vec(0usize..20, 1..12),
            fraction in prop::sample::select(vec![0.3f32, 0.7, 1.0]),
            seed in any::<u64>(),
        ) {
            let mut buf = SimpleBuffer::new(size, fraction, seed).unwrap();
            let mut counter = 0.0f32;
            for n in batches {
                let values: Vec<f32> = (0..n).map(|_| { counter += 1.0; counter }).collect();
                buf.update(&marked(&values).view()).unwrap();
                prop_assert!(buf.len() <= size);

                // Rows are strictly increasing in insertion order: the buffer only ever holds a
                // suffix of what was kept, oldest first.
                let col = first_column(&buf);
                prop_assert!(col.windows(2).all(|w| w[0] < w[1]));
                if fraction == 1.0 {
                    let expected: Vec<f32> = (0..buf.len())
                        .map(|i| counter - (buf.len() - 1 - i) as f32)
                        .collect();
                    prop_assert_eq!(col, expected);
                }
            }
        }

        #[test]
        fn prop_samples_are_members(
            n_rows in 1usize..20,
            k in 1usize..64,
            seed in any::<u64>(),
        ) {
            let mut buf = SimpleBuffer::new(32, 1.0, seed).unwrap();
            let values: Vec<f32> = (0..n_rows).map(|i| i as f32).collect();
            buf.update(&marked(&values).view()).unwrap();
            let s = buf.sample(k).unwrap();
            prop_assert_eq!(s.dim(), (k, 2));
            for row in s.rows() {
                prop_assert!(buf.rows().any(|r| r == &row));
            }
        }
    }
}
