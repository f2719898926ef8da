//! Test-time training for masked-autoencoder vision models.
//!
//! Before classifying a test image, the model first adapts to it: a few
//! optimizer steps of masked-patch reconstruction on augmented views of
//! that single image, then a vote over the adapted model's predictions.
//! The crate covers the fixed-budget variant (weights reset to the base
//! checkpoint after every image) and the online variant (weights persist
//! across a stream, with periodic-reset and checkpoint-swap policies).
//!
//! ## Main Components
//!
//! - `model`: the `TestTimeModel` seam and a small ndarray reference MAE
//! - `training`: adaptation, evaluation, reinitialization, the run engine
//! - `data`: dataset folder, step schedules, view transforms, prefetching
//! - `results`: incremental `.npy` segments, resume markers, reports
//! - `metrics`: running accuracy and loss means reported during a run
//! - `checkpoints`: safetensors state dicts and the swap slot
//! - `config`: run configuration grouped by concern

pub mod checkpoints;
pub mod config;
pub mod data;
pub mod metrics;
pub mod model;
pub mod results;
pub mod training;

pub use config::Config;

/// Library errors
pub use anyhow::{Error, Result};
