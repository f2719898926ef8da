//! The single checkpoint slot used by the checkpoint-swap policy.
//!
//! Exactly one snapshot exists at a time; every save overwrites the last.
//! The slot is injected into the reinitialization policy so tests can
//! observe and replay saves without touching disk.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use super::{load_model_state, save_model_state, ModelState};

pub trait CheckpointSlot {
    /// Overwrite the slot with a parameter-only snapshot.
    fn save(&mut self, state: &ModelState) -> Result<()>;

    /// Read the snapshot back.
    fn load(&self) -> Result<ModelState>;

    fn exists(&self) -> bool;
}

/// Slot backed by one safetensors file.
pub struct DiskSlot {
    path: PathBuf,
}

impl DiskSlot {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl CheckpointSlot for DiskSlot {
    fn save(&mut self, state: &ModelState) -> Result<()> {
        save_model_state(&self.path, state, None)
            .with_context(|| format!("Failed to write checkpoint slot: {:?}", self.path))
    }

    fn load(&self) -> Result<ModelState> {
        let (state, _) = load_model_state(&self.path)
            .with_context(|| format!("Failed to read checkpoint slot: {:?}", self.path))?;
        Ok(state)
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// In-memory slot: the test double, also handy for dry runs.
#[derive(Default)]
pub struct MemorySlot {
    state: Option<ModelState>,
    pub saves: usize,
    pub loads: std::cell::Cell<usize>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointSlot for MemorySlot {
    fn save(&mut self, state: &ModelState) -> Result<()> {
        self.state = Some(state.clone());
        self.saves += 1;
        Ok(())
    }

    fn load(&self) -> Result<ModelState> {
        self.loads.set(self.loads.get() + 1);
        match &self.state {
            Some(state) => Ok(state.clone()),
            None => bail!("checkpoint slot is empty"),
        }
    }

    fn exists(&self) -> bool {
        self.state.is_some()
    }
}
