//! Checkpoint persistence: safetensors state dicts and the swap slot.

pub mod slot;
pub mod state;

use std::fs::File;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};

pub use slot::{CheckpointSlot, DiskSlot, MemorySlot};
pub use state::{num_parameters, ModelState, TensorData};

/// Key under which an optional loss-scaler scale rides along in a
/// checkpoint file. It is split out on load and never enters the model.
pub const LOSS_SCALE_KEY: &str = "__loss_scale__";

/// Write a state dict (and optionally a scaler scale) as safetensors.
pub fn save_model_state(
    path: &Path,
    state: &ModelState,
    loss_scale: Option<f32>,
) -> Result<()> {
    if state.is_empty() {
        bail!("refusing to write an empty state dict");
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create checkpoint directory: {:?}", parent))?;
        }
    }

    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(state.len() + 1);
    for (name, tensor) in state {
        let mut bytes = Vec::with_capacity(tensor.data.len() * 4);
        for value in &tensor.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        buffers.push((name.clone(), tensor.shape.clone(), bytes));
    }
    if let Some(scale) = loss_scale {
        buffers.push((LOSS_SCALE_KEY.to_string(), vec![1], scale.to_le_bytes().to_vec()));
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| anyhow!("tensor {:?} cannot be serialized: {e:?}", name))?;
        views.push((name.clone(), view));
    }
    safetensors::serialize_to_file(views, &None, path)
        .map_err(|e| anyhow!("Failed to write checkpoint {:?}: {e:?}", path))?;
    Ok(())
}

/// Read a safetensors state dict; returns the scaler scale separately when
/// the file carries one.
pub fn load_model_state(path: &Path) -> Result<(ModelState, Option<f32>)> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open checkpoint: {:?}", path))?;
    // Safety: the mapping is read-only and lives only for this call.
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to map checkpoint: {:?}", path))?;
    let tensors = SafeTensors::deserialize(&mmap)
        .map_err(|e| anyhow!("Failed to parse checkpoint {:?}: {e:?}", path))?;

    let mut state = ModelState::new();
    let mut loss_scale = None;
    for (name, view) in tensors.tensors() {
        if view.dtype() != Dtype::F32 {
            bail!(
                "checkpoint tensor {:?} has dtype {:?}, expected F32",
                name,
                view.dtype()
            );
        }
        let data: Vec<f32> = view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if name == LOSS_SCALE_KEY {
            loss_scale = data.first().copied();
            continue;
        }
        let tensor = TensorData::new(data, view.shape().to_vec())
            .with_context(|| format!("checkpoint tensor {:?} is malformed", name))?;
        state.insert(name.to_string(), tensor);
    }
    if state.is_empty() {
        bail!("checkpoint {:?} holds no tensors", path);
    }
    Ok((state, loss_scale))
}

/// Load the pristine base weights, merging head parameters from a separate
/// head checkpoint when one is supplied.
///
/// Linear heads contribute `head.*` keys, vit heads `classifier.*` keys;
/// merged entries replace whatever the base file carried.
pub fn load_base_checkpoint(
    model_path: &Path,
    head_path: Option<&Path>,
    head_prefixes: &[&str],
) -> Result<(ModelState, Option<f32>)> {
    let (mut state, loss_scale) = load_model_state(model_path)?;
    if let Some(head) = head_path {
        let (head_state, _) = load_model_state(head)?;
        let mut merged = 0;
        for (name, tensor) in head_state {
            if head_prefixes.iter().any(|p| name.starts_with(p)) {
                state.insert(name, tensor);
                merged += 1;
            }
        }
        if merged == 0 {
            bail!(
                "head checkpoint {:?} holds no tensors matching {:?}",
                head,
                head_prefixes
            );
        }
        tracing::debug!(merged, "merged head tensors into base state");
    }
    Ok((state, loss_scale))
}

/// Filename for the single swap-slot checkpoint inside an output directory.
pub fn slot_path(output_dir: &Path) -> std::path::PathBuf {
    output_dir.join("model-last.safetensors")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ModelState {
        let mut state = ModelState::new();
        state.insert(
            "encoder.weight".to_string(),
            TensorData::new(vec![0.5, -0.5, 1.5, 2.5, 0.0, -3.0], vec![2, 3]).unwrap(),
        );
        state.insert(
            "encoder.bias".to_string(),
            TensorData::new(vec![0.1, 0.2, 0.3], vec![3]).unwrap(),
        );
        state
    }

    #[test]
    fn state_round_trips_through_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        let state = sample_state();
        save_model_state(&path, &state, None).unwrap();
        let (back, scale) = load_model_state(&path).unwrap();
        assert_eq!(back, state);
        assert_eq!(scale, None);
    }

    #[test]
    fn loss_scale_rides_along_without_entering_the_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        save_model_state(&path, &sample_state(), Some(42.0)).unwrap();
        let (back, scale) = load_model_state(&path).unwrap();
        assert_eq!(scale, Some(42.0));
        assert!(!back.contains_key(LOSS_SCALE_KEY));
    }

    #[test]
    fn head_merge_replaces_prefixed_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.safetensors");
        let head_path = dir.path().join("head.safetensors");

        let mut base = sample_state();
        base.insert(
            "head.weight".to_string(),
            TensorData::new(vec![0.0; 4], vec![2, 2]).unwrap(),
        );
        save_model_state(&base_path, &base, None).unwrap();

        let mut head = ModelState::new();
        head.insert(
            "head.weight".to_string(),
            TensorData::new(vec![9.0; 4], vec![2, 2]).unwrap(),
        );
        head.insert(
            "unrelated.weight".to_string(),
            TensorData::new(vec![1.0], vec![1]).unwrap(),
        );
        save_model_state(&head_path, &head, None).unwrap();

        let (merged, _) =
            load_base_checkpoint(&base_path, Some(&head_path), &["head."]).unwrap();
        assert_eq!(merged["head.weight"].data, vec![9.0; 4]);
        assert!(!merged.contains_key("unrelated.weight"));
        assert_eq!(merged["encoder.bias"].data, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn empty_states_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.safetensors");
        assert!(save_model_state(&path, &ModelState::new(), None).is_err());
    }
}
