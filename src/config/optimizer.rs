use serde::{Deserialize, Serialize};

use crate::training::OptimizerKind;

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub optimizer: String,
    /// Base learning rate, scaled by effective batch size below.
    pub blr: f32,
    /// Absolute learning rate; overrides the base-rate scaling when set.
    pub lr: Option<f32>,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer: "sgd".to_string(),
            blr: 1e-3,
            lr: None,
            momentum: 0.9,
            weight_decay: 0.05,
        }
    }
}

impl OptimizerConfig {
    pub fn kind(&self) -> anyhow::Result<OptimizerKind> {
        OptimizerKind::from_name(&self.optimizer)
    }

    /// lr = blr * effective_batch / 256, unless an absolute lr was given.
    pub fn absolute_lr(&self, batch_size: usize, accum_iter: usize) -> f32 {
        match self.lr {
            Some(lr) => lr,
            None => self.blr * (batch_size * accum_iter) as f32 / 256.0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.kind()?;
        if !self.blr.is_finite() || self.blr <= 0.0 {
            anyhow::bail!("blr must be positive, got {}", self.blr);
        }
        if let Some(lr) = self.lr {
            if !lr.is_finite() || lr <= 0.0 {
                anyhow::bail!("lr must be positive, got {}", lr);
            }
        }
        if self.weight_decay < 0.0 {
            anyhow::bail!("weight_decay must be >= 0, got {}", self.weight_decay);
        }
        Ok(())
    }
}
