use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Masked-autoencoder size presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Small,
    Large,
    Huge,
}

impl ModelVariant {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        MODEL_PRESETS
            .get(name)
            .map(|preset| preset.variant)
            .ok_or_else(|| {
                let mut available: Vec<&str> = MODEL_PRESETS.keys().copied().collect();
                available.sort();
                anyhow::anyhow!("Unknown model variant: {}. Available: {:?}", name, available)
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariant::Small => "small",
            ModelVariant::Large => "large",
            ModelVariant::Huge => "huge",
        }
    }

    pub fn patch_size(&self) -> usize {
        match self {
            ModelVariant::Small => 16,
            ModelVariant::Large => 16,
            ModelVariant::Huge => 14,
        }
    }

    pub fn embed_dim(&self) -> usize {
        match self {
            ModelVariant::Small => 512,
            ModelVariant::Large => 768,
            ModelVariant::Huge => 768,
        }
    }

    pub fn classifier_hidden(&self) -> usize {
        match self {
            ModelVariant::Small => 512,
            ModelVariant::Large => 768,
            ModelVariant::Huge => 768,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            ModelVariant::Small => "Small encoder, 16px patches",
            ModelVariant::Large => "Large encoder, 16px patches",
            ModelVariant::Huge => "Huge encoder, 14px patches",
        }
    }
}

/// Classification head placed on top of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadType {
    /// Single linear probe.
    Linear,
    /// Two-layer MLP with dropout.
    VitHead,
}

impl HeadType {
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name {
            "linear" => Ok(HeadType::Linear),
            "vit_head" => Ok(HeadType::VitHead),
            other => anyhow::bail!("Unknown head type: {}. Available: linear, vit_head", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HeadType::Linear => "linear",
            HeadType::VitHead => "vit_head",
        }
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub variant: ModelVariant,
    pub input_size: usize,
    pub channels: usize,
    pub num_classes: usize,
    pub head_type: HeadType,
    pub head_dropout: f32,
    pub norm_pix_loss: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            variant: ModelVariant::Large,
            input_size: 224,
            channels: 3,
            num_classes: 1000,
            head_type: HeadType::VitHead,
            head_dropout: 0.0,
            norm_pix_loss: false,
        }
    }
}

impl ModelConfig {
    pub fn patch_size(&self) -> usize {
        self.variant.patch_size()
    }

    pub fn embed_dim(&self) -> usize {
        self.variant.embed_dim()
    }

    pub fn classifier_hidden(&self) -> usize {
        self.variant.classifier_hidden()
    }

    pub fn patches_per_side(&self) -> usize {
        let patch = self.patch_size();
        if patch == 0 {
            0
        } else {
            self.input_size / patch
        }
    }
}

pub struct ModelPreset {
    pub variant: ModelVariant,
    pub patch_size: usize,
    pub embed_dim: usize,
    pub classifier_hidden: usize,
    pub description: &'static str,
}

/// Available encoder presets, keyed by CLI name.
pub static MODEL_PRESETS: Lazy<HashMap<&'static str, ModelPreset>> = Lazy::new(|| {
    let mut presets = HashMap::new();
    for variant in [ModelVariant::Small, ModelVariant::Large, ModelVariant::Huge] {
        presets.insert(
            variant.as_str(),
            ModelPreset {
                variant,
                patch_size: variant.patch_size(),
                embed_dim: variant.embed_dim(),
                classifier_hidden: variant.classifier_hidden(),
                description: variant.description(),
            },
        );
    }
    presets
});
