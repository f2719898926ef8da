//! Reset policy between images.
//!
//! Fixed-budget runs return to the base checkpoint after every image.
//! Online runs carry weights forward, optionally resetting on a fixed
//! cadence or swapping through a one-deep checkpoint slot that holds the
//! state right after the previous image's first optimizer step.

use anyhow::{bail, Result};

use crate::checkpoints::{CheckpointSlot, ModelState};
use crate::config::Config;
use crate::model::TestTimeModel;
use crate::training::optimizer::{LossScaler, Optimizer, OptimizerKind};

pub struct ReinitializationPolicy {
    base_state: ModelState,
    base_scale: Option<f32>,
    kind: OptimizerKind,
    lr: f32,
    momentum: f32,
    weight_decay: f32,
    trainable: Vec<String>,
    online: bool,
    periodic: Option<usize>,
    checkpoint_swap: bool,
    load_loss_scaler: bool,
    slot: Option<Box<dyn CheckpointSlot>>,
    skip_next_restore: bool,
}

impl ReinitializationPolicy {
    /// Seeds the swap slot with the base state so the first image restores
    /// a no-op.
    pub fn new(
        config: &Config,
        base_state: ModelState,
        base_scale: Option<f32>,
        trainable: Vec<String>,
        mut slot: Option<Box<dyn CheckpointSlot>>,
    ) -> Result<Self> {
        let checkpoint_swap = config.training.checkpoint_swap;
        if checkpoint_swap {
            match slot.as_mut() {
                Some(slot) => slot.save(&base_state)?,
                None => bail!("checkpoint swap needs a checkpoint slot"),
            }
        }
        Ok(Self {
            base_state,
            base_scale,
            kind: config.optimizer.kind()?,
            lr: config.effective_lr(),
            momentum: config.optimizer.momentum,
            weight_decay: config.optimizer.weight_decay,
            trainable,
            online: config.training.online,
            periodic: config.training.periodic_reset(),
            checkpoint_swap,
            load_loss_scaler: config.training.load_loss_scaler,
            slot,
            skip_next_restore: false,
        })
    }

    /// Restore the base checkpoint and hand back untouched optimizer state.
    pub fn full_reset(
        &self,
        model: &mut dyn TestTimeModel,
    ) -> Result<(Optimizer, LossScaler)> {
        model.load_state_dict(&self.base_state)?;
        let mut optimizer = Optimizer::new(
            self.kind,
            self.lr,
            self.momentum,
            self.weight_decay,
            self.trainable.clone(),
        )?;
        optimizer.zero_grad(model);
        let scaler = match self.base_scale {
            Some(scale) if self.load_loss_scaler => LossScaler::with_scale(scale),
            _ => LossScaler::new(),
        };
        Ok((optimizer, scaler))
    }

    /// Swap-mode restore at the top of an image. A reset at the previous
    /// image's end takes precedence over the slot, once.
    pub fn at_image_start(
        &mut self,
        model: &mut dyn TestTimeModel,
        optimizer: &mut Optimizer,
    ) -> Result<()> {
        if !self.checkpoint_swap {
            return Ok(());
        }
        if self.skip_next_restore {
            self.skip_next_restore = false;
        } else {
            match self.slot.as_ref() {
                Some(slot) => {
                    let state = slot.load()?;
                    model.load_state_dict(&state)?;
                }
                None => bail!("checkpoint slot missing"),
            }
        }
        optimizer.zero_grad(model);
        Ok(())
    }

    /// Swap-mode slot save, called right after an image's first optimizer
    /// step.
    pub fn after_first_boundary(&mut self, model: &dyn TestTimeModel) -> Result<()> {
        if !self.checkpoint_swap {
            return Ok(());
        }
        let state = model.state_dict();
        match self.slot.as_mut() {
            Some(slot) => slot.save(&state),
            None => bail!("checkpoint slot missing"),
        }
    }

    /// Reset decision once an image finishes. `completed` counts images
    /// finished so far across the whole run, resumed segments included.
    pub fn at_image_end(
        &mut self,
        completed: usize,
        model: &mut dyn TestTimeModel,
    ) -> Result<Option<(Optimizer, LossScaler)>> {
        if !self.online {
            return self.full_reset(model).map(Some);
        }
        if let Some(interval) = self.periodic {
            if completed % interval == 0 {
                println!("Reinitializing model after {} examples...", interval);
                let fresh = self.full_reset(model)?;
                self.skip_next_restore = true;
                return Ok(Some(fresh));
            }
        }
        Ok(None)
    }
}
