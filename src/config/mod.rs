pub mod model;
pub mod optimizer;
pub mod paths;
pub mod training;

use serde::{Deserialize, Serialize};

pub use model::{HeadType, ModelConfig, ModelPreset, ModelVariant, MODEL_PRESETS};
pub use optimizer::OptimizerConfig;
pub use paths::PathConfig;
pub use training::TrainingConfig;

/// Main configuration for a test-time training run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub optimizer: OptimizerConfig,
    pub paths: PathConfig,
}

impl Config {
    pub fn for_variant(variant_name: &str) -> anyhow::Result<Self> {
        let variant = ModelVariant::from_name(variant_name)?;
        Ok(Self {
            model: ModelConfig {
                variant,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.training.validate()?;
        self.optimizer.validate()?;
        let patch = self.model.patch_size();
        if self.model.input_size == 0 || self.model.input_size % patch != 0 {
            anyhow::bail!(
                "input size {} is not divisible by the {}px patch",
                self.model.input_size,
                patch
            );
        }
        if self.model.channels == 0 {
            anyhow::bail!("channels must be > 0");
        }
        Ok(())
    }

    /// One-line JSON rendering, written at the top of the accuracy report.
    pub fn summary_line(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The learning rate the run actually uses.
    pub fn effective_lr(&self) -> f32 {
        self.optimizer
            .absolute_lr(self.training.batch_size, self.training.accum_iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn for_variant_swaps_the_preset() {
        let config = Config::for_variant("huge").unwrap();
        assert_eq!(config.model.variant, ModelVariant::Huge);
        assert!(Config::for_variant("giant").is_err());
    }

    #[test]
    fn huge_preset_rejects_default_input_size() {
        let config = Config::for_variant("huge").unwrap();
        // 224 % 14 == 0, so the huge preset still validates.
        config.validate().unwrap();

        let mut odd = config;
        odd.model.input_size = 225;
        assert!(odd.validate().is_err());
    }

    #[test]
    fn summary_line_is_single_line_json() {
        let line = Config::default().summary_line().unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"mask_ratio\""));
        let parsed: Config = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.training.batch_size, 1);
    }
}
