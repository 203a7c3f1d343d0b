//! Where training reports go.
//!
//! Scalars are emitted as one flat [`Record`] per step to a [`MetricsSink`]. Anything visual is
//! handed to a [`Visualizer`]; the trainer never renders itself.

use crate::sampler::Trajectory;
use ndarray::ArrayView2;
use std::collections::BTreeMap;
use tracing::info;

/// Named scalars produced by one training or evaluation step.
pub type Record = BTreeMap<String, f32>;

pub trait MetricsSink {
    fn log(&mut self, record: &Record);
}

/// Forwards every scalar as one `tracing` event on target `sbridge::metrics`, with structured
/// `metric` and `value` fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, record: &Record) {
        for (k, v) in record {
            info!(target: "sbridge::metrics", metric = %k, value = *v);
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub records: Vec<Record>,
}

impl MemorySink {
    /// All logged values of `key`, in logging order.
    pub fn series(&self, key: &str) -> Vec<f32> {
        self.records.iter().filter_map(|r| r.get(key).copied()).collect()
    }

    pub fn last(&self, key: &str) -> Option<f32> {
        self.records.iter().rev().find_map(|r| r.get(key).copied())
    }
}

impl MetricsSink for MemorySink {
    fn log(&mut self, record: &Record) {
        self.records.push(record.clone());
    }
}

/// Consumer of evaluation data that is not a scalar. All hooks default to no-ops.
pub trait Visualizer {
    /// `images` mode: start batch and forward-simulated terminal batch.
    fn images(&mut self, _sb_iter: usize, _x0: &ArrayView2<f32>, _x1_pred: &ArrayView2<f32>) {}

    /// `images` mode: a sample of the (refined) replay buffer.
    fn buffer_images(&mut self, _sb_iter: usize, _samples: &ArrayView2<f32>) {}

    /// `2d` mode: a full forward trajectory.
    fn trajectory(&mut self, _sb_iter: usize, _trajectory: &Trajectory) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVisualizer;

impl Visualizer for NoVisualizer {}

/// Build a record from `(key, value)` pairs.
pub(crate) fn record<I: IntoIterator<Item = (&'static str, f32)>>(items: I) -> Record {
    items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
