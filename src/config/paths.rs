use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub data_dir: String,
    pub output_dir: String,
    /// Pretrained encoder checkpoint (required by `run`).
    pub model_checkpoint: String,
    /// Separately trained classifier head, merged over the encoder state.
    pub head_checkpoint: Option<String>,
    /// Optional list of dataset indices to restrict the run to.
    pub minimizer_file: Option<String>,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            output_dir: "output".to_string(),
            model_checkpoint: "checkpoints/mae-base.safetensors".to_string(),
            head_checkpoint: None,
            minimizer_file: None,
        }
    }
}

impl PathConfig {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    pub fn model_checkpoint_path(&self) -> PathBuf {
        PathBuf::from(&self.model_checkpoint)
    }

    pub fn head_checkpoint_path(&self) -> Option<PathBuf> {
        self.head_checkpoint.as_ref().map(PathBuf::from)
    }

    pub fn minimizer_path(&self) -> Option<PathBuf> {
        self.minimizer_file.as_ref().map(PathBuf::from)
    }
}
