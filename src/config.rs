//! Run configuration.
//!
//! Every knob of a training run lives in one [`BridgeConfig`]. It is validated once, when the
//! trainer is constructed, and read-only afterwards.

use crate::buffer::BufferConfig;
use crate::optim::OptimizerConfig;
use crate::sampler::{MatchingMethod, TimeGrid};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// What the evaluation step hands to the visualizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LoggingData {
    /// Start/terminal batches and buffer samples.
    #[default]
    #[serde(rename = "images")]
    Images,
    /// Full forward trajectories, plus the W2 distance to exact target samples.
    #[serde(rename = "2d")]
    TwoD,
}

impl FromStr for LoggingData {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "images" => Ok(Self::Images),
            "2d" => Ok(Self::TwoD),
            other => Err(Error::Config(format!(
                "unknown logging data `{other}` (expected one of: images, 2d)"
            ))),
        }
    }
}

/// Coefficients of the Ornstein-Uhlenbeck reference drift.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub alpha: f32,
    pub gamma: f32,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            gamma: 1.0,
        }
    }
}

/// Hyperparameters of one SB training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub matching_method: MatchingMethod,
    pub t_max: f32,
    pub n_steps: usize,
    /// Must equal `t_max / n_steps`.
    pub dt: f32,

    pub num_bwd_steps: usize,
    pub num_fwd_steps: usize,
    pub batch_size: usize,
    pub val_batch_size: usize,
    /// Trajectories per start point; `> 1` selects the VarGrad loss.
    pub n_trajectories: usize,
    pub off_policy_fraction: f32,
    /// Off-policy mixing starts once `sb_iter > start_mixed_from`.
    pub start_mixed_from: i64,
    pub drift_reg_coeff: f32,

    pub logging_data: LoggingData,
    pub n_eval_trajectories: usize,
    /// Relative entropic regularisation of the W2 metric.
    pub w2_reg: f32,

    pub ema_decay: f32,
    pub optimizer: OptimizerConfig,
    /// Learning rate of `log Z` (single-trajectory loss only).
    pub log_z_lr: f32,
    pub reference: ReferenceConfig,
    pub buffer: BufferConfig,
    pub seed: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            matching_method: MatchingMethod::Ll,
            t_max: 1.0,
            n_steps: 20,
            dt: 0.05,
            num_bwd_steps: 100,
            num_fwd_steps: 100,
            batch_size: 64,
            val_batch_size: 64,
            n_trajectories: 2,
            off_policy_fraction: 0.25,
            start_mixed_from: 0,
            drift_reg_coeff: 0.0,
            logging_data: LoggingData::Images,
            n_eval_trajectories: 16,
            w2_reg: 0.05,
            ema_decay: 0.99,
            optimizer: OptimizerConfig::default(),
            log_z_lr: 1e-2,
            reference: ReferenceConfig::default(),
            buffer: BufferConfig::default(),
            seed: 0,
        }
    }
}

fn config_err(msg: &str) -> Error {
    Error::Config(msg.to_string())
}

impl BridgeConfig {
    /// Parse a JSON document (missing fields take their defaults) and validate it.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// The simulation grid described by `dt`, `n_steps` and `t_max`.
    pub fn grid(&self) -> Result<TimeGrid> {
        TimeGrid::with_dt(self.dt, self.n_steps, self.t_max).map_err(|e| match e {
            Error::Domain(msg) => Error::Config(msg.to_string()),
            other => other,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.grid()?;
        if self.batch_size == 0 || self.val_batch_size == 0 {
            return Err(config_err("batch sizes must be >= 1"));
        }
        if self.n_trajectories == 0 {
            return Err(config_err("n_trajectories must be >= 1"));
        }
        if self.batch_size < self.n_trajectories {
            return Err(config_err("batch_size must be >= n_trajectories"));
        }
        if !(0.0..=1.0).contains(&self.off_policy_fraction) {
            return Err(Error::Config(format!(
                "off_policy_fraction must be in [0, 1], got {}",
                self.off_policy_fraction
            )));
        }
        if self.start_mixed_from < 0 {
            return Err(Error::Config(format!(
                "start_mixed_from must be non-negative, got {}",
                self.start_mixed_from
            )));
        }
        if !(self.drift_reg_coeff >= 0.0) || !self.drift_reg_coeff.is_finite() {
            return Err(config_err("drift_reg_coeff must be non-negative and finite"));
        }
        if self.n_eval_trajectories == 0 {
            return Err(config_err("n_eval_trajectories must be >= 1"));
        }
        if !(self.w2_reg > 0.0) || !self.w2_reg.is_finite() {
            return Err(config_err("w2_reg must be positive and finite"));
        }
        if !(0.0..1.0).contains(&self.ema_decay) {
            return Err(config_err("ema_decay must be in [0, 1)"));
        }
        if !(self.log_z_lr > 0.0) || !self.log_z_lr.is_finite() {
            return Err(config_err("log_z_lr must be positive and finite"));
        }
        if !self.reference.alpha.is_finite() || !self.reference.gamma.is_finite() {
            return Err(config_err("reference coefficients must be finite"));
        }
        self.optimizer.validate()?;
        self.buffer.validate()?;
        Ok(())
    }

    /// Rows per forward-loss call, before replication.
    pub fn base_batch_size(&self) -> usize {
        self.batch_size / self.n_trajectories
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferKind;

    #[test]
    fn defaults_are_valid() {
        let cfg = BridgeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.grid().unwrap().n_steps(), 20);
        assert_eq!(cfg.base_batch_size(), 32);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = BridgeConfig::from_json(
            r#"{
                "matching_method": "sde",
                "logging_data": "2d",
                "buffer": {"kind": "langevin", "size": 256, "langevin": {"sampler": "mala"}},
                "optimizer": {"lr": 0.01, "max_grad_norm": 5.0}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.matching_method, MatchingMethod::Sde);
        assert_eq!(cfg.logging_data, LoggingData::TwoD);
        assert_eq!(cfg.buffer.kind, BufferKind::Langevin);
        assert_eq!(cfg.buffer.size, 256);
        assert_eq!(cfg.buffer.langevin.num_steps, 20);
        assert_eq!(cfg.optimizer.max_grad_norm, Some(5.0));
        assert_eq!(cfg.n_steps, 20);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = BridgeConfig {
            logging_data: LoggingData::TwoD,
            seed: 17,
            ..BridgeConfig::default()
        };
        let back = BridgeConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        for doc in [
            r#"{"buffer": {"kind": "ring"}}"#,
            r#"{"matching_method": "euler"}"#,
            r#"{"logging_data": "video"}"#,
        ] {
            assert!(matches!(BridgeConfig::from_json(doc), Err(Error::Config(_))), "{doc}");
        }
        assert!(matches!("video".parse::<LoggingData>(), Err(Error::Config(_))));
        assert_eq!("2d".parse::<LoggingData>().unwrap(), LoggingData::TwoD);
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let cases = [
            BridgeConfig {
                start_mixed_from: -1,
                ..BridgeConfig::default()
            },
            BridgeConfig {
                dt: 0.1,
                ..BridgeConfig::default()
            },
            BridgeConfig {
                n_trajectories: 0,
                ..BridgeConfig::default()
            },
            BridgeConfig {
                batch_size: 2,
                n_trajectories: 4,
                ..BridgeConfig::default()
            },
            BridgeConfig {
                off_policy_fraction: 1.5,
                ..BridgeConfig::default()
            },
            BridgeConfig {
                ema_decay: 1.0,
                ..BridgeConfig::default()
            },
        ];
        for cfg in cases {
            assert!(matches!(cfg.validate(), Err(Error::Config(_))), "{cfg:?}");
        }
    }
}
