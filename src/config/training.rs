use serde::{Deserialize, Serialize};

use crate::model::FinetuneScope;

/// Test-time training configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Fraction of patches hidden during adaptation forwards.
    pub mask_ratio: f32,
    /// Optimizer steps granted to every image (to every later image when
    /// online).
    pub steps_per_example: usize,
    /// Optimizer steps granted to the first image of an online run.
    pub steps_first_example: usize,
    /// Micro-steps accumulated into one optimizer step. Also the number of
    /// stochastic passes averaged per evaluation.
    pub accum_iter: usize,
    /// Carry weights from image to image instead of resetting after each.
    pub online: bool,
    /// Visit images in a seeded random order.
    pub shuffle: bool,
    pub shuffle_seed: u64,
    /// Online only: reset to the base state after every N images. Zero or
    /// negative disables the reset.
    pub reinit_interval: i64,
    /// Online only: park the adapted weights in a disk slot after the first
    /// optimizer step of each image and restore from it at the next image.
    pub checkpoint_swap: bool,
    pub batch_size: usize,
    pub seed: u64,
    /// Augmentation noise applied to train views.
    pub jitter_std: f32,
    /// Draw one view per micro-step and repeat it across the batch.
    pub single_crop: bool,
    pub finetune_scope: FinetuneScope,
    /// Seed the fresh loss scaler from the base checkpoint's stored scale.
    pub load_loss_scaler: bool,
    pub num_workers: usize,
    pub print_freq: usize,
    pub verbose: bool,
    /// Dump reconstruction snapshots for a sample of images.
    pub print_images: bool,
    pub num_print_images: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            mask_ratio: 0.75,
            steps_per_example: 1,
            steps_first_example: 250,
            accum_iter: 1,
            online: false,
            shuffle: false,
            shuffle_seed: 0,
            reinit_interval: -1,
            checkpoint_swap: false,
            batch_size: 1,
            seed: 0,
            jitter_std: 0.05,
            single_crop: false,
            finetune_scope: FinetuneScope::Encoder,
            load_loss_scaler: false,
            num_workers: 1,
            print_freq: 50,
            verbose: false,
            print_images: false,
            num_print_images: 5,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        if self.accum_iter == 0 {
            anyhow::bail!("accum_iter must be > 0");
        }
        if self.steps_per_example == 0 {
            anyhow::bail!("steps_per_example must be > 0");
        }
        if self.online && self.steps_first_example < self.steps_per_example {
            anyhow::bail!(
                "steps_first_example ({}) must be at least steps_per_example ({}) for online runs",
                self.steps_first_example,
                self.steps_per_example
            );
        }
        if self.shuffle && !self.online {
            anyhow::bail!("shuffle requires the online loop");
        }
        if self.checkpoint_swap && !self.online {
            anyhow::bail!("checkpoint_swap requires the online loop");
        }
        if !(0.0..1.0).contains(&self.mask_ratio) {
            anyhow::bail!("mask_ratio must lie in [0, 1), got {}", self.mask_ratio);
        }
        if self.print_images && self.num_print_images == 0 {
            anyhow::bail!("num_print_images must be > 0 when print_images is set");
        }
        Ok(())
    }

    /// Micro-steps spent on one image: optimizer steps times accumulation.
    pub fn micro_steps_per_example(&self) -> usize {
        self.steps_per_example * self.accum_iter
    }

    pub fn micro_steps_first_example(&self) -> usize {
        self.steps_first_example * self.accum_iter
    }

    /// Whether the periodic base-state reset is active.
    pub fn periodic_reset(&self) -> Option<usize> {
        if self.online && self.reinit_interval > 0 {
            Some(self.reinit_interval as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_settings() {
        let mut config = TrainingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.batch_size = 1;
        config.mask_ratio = 1.0;
        assert!(config.validate().is_err());

        config.mask_ratio = 0.75;
        config.accum_iter = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn online_first_budget_must_cover_the_offset_window() {
        let mut config = TrainingConfig {
            online: true,
            steps_per_example: 4,
            steps_first_example: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.steps_first_example = 4;
        config.validate().unwrap();
    }

    #[test]
    fn micro_step_windows_scale_with_accumulation() {
        let config = TrainingConfig {
            steps_per_example: 2,
            steps_first_example: 5,
            accum_iter: 3,
            ..Default::default()
        };
        assert_eq!(config.micro_steps_per_example(), 6);
        assert_eq!(config.micro_steps_first_example(), 15);
    }

    #[test]
    fn periodic_reset_requires_online_and_positive_interval() {
        let mut config = TrainingConfig {
            online: true,
            reinit_interval: 4,
            ..Default::default()
        };
        assert_eq!(config.periodic_reset(), Some(4));
        config.reinit_interval = -1;
        assert_eq!(config.periodic_reset(), None);
        config.reinit_interval = 4;
        config.online = false;
        assert_eq!(config.periodic_reset(), None);
    }
}
