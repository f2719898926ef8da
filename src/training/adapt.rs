//! One masked-reconstruction micro-step.

use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array4};

use crate::model::TestTimeModel;
use crate::training::optimizer::{LossScaler, Optimizer};

/// What one micro-step produced.
#[derive(Debug)]
pub struct MicroStep {
    /// Unscaled loss of this forward pass.
    pub loss: f32,
    /// Mean loss over the accumulation window, present at a boundary.
    pub boundary_loss: Option<f32>,
    /// Reconstructed patch grid of the first view.
    pub pred_patches: Option<Array2<f32>>,
    /// Patch mask of the first view (1 = masked).
    pub mask: Option<Array1<f32>>,
}

impl MicroStep {
    pub fn is_boundary(&self) -> bool {
        self.boundary_loss.is_some()
    }
}

/// Drives masked-reconstruction gradient steps with accumulation.
///
/// Each call runs one forward/backward on a batch of augmented views; the
/// optimizer advances and gradients clear only every `accum_iter` calls.
/// A non-finite loss aborts the run on the spot.
pub struct AdaptationUnit {
    mask_ratio: f32,
    accum_iter: usize,
    window: Vec<f32>,
}

impl AdaptationUnit {
    pub fn new(mask_ratio: f32, accum_iter: usize) -> Result<Self> {
        if !(0.0..1.0).contains(&mask_ratio) {
            bail!("mask_ratio must lie in [0, 1), got {}", mask_ratio);
        }
        if accum_iter == 0 {
            bail!("accum_iter must be > 0");
        }
        Ok(Self {
            mask_ratio,
            accum_iter,
            window: Vec::with_capacity(accum_iter),
        })
    }

    /// One micro-step. `micro_index` counts from 0 within the image window;
    /// index `accum_iter - 1`, `2 * accum_iter - 1`, ... are boundaries.
    pub fn micro_step(
        &mut self,
        model: &mut dyn TestTimeModel,
        optimizer: &mut Optimizer,
        scaler: &mut LossScaler,
        views: &Array4<f32>,
        micro_index: usize,
    ) -> Result<MicroStep> {
        let pass = model.forward(views, None, self.mask_ratio, true)?;
        let loss = pass.total_loss();
        if !loss.is_finite() {
            bail!("Loss is {}, stopping training", loss);
        }
        self.window.push(loss);

        let update_grad = (micro_index + 1) % self.accum_iter == 0;
        scaler.backward_and_maybe_step(
            model,
            optimizer,
            1.0 / self.accum_iter as f32,
            update_grad,
        )?;

        let boundary_loss = if update_grad {
            optimizer.zero_grad(model);
            let mean = self.window.iter().sum::<f32>() / self.window.len() as f32;
            self.window.clear();
            Some(mean)
        } else {
            None
        };

        Ok(MicroStep {
            loss,
            boundary_loss,
            pred_patches: pass.pred_patches,
            mask: pass.mask,
        })
    }

    /// Drop any partial accumulation window at an image boundary.
    pub fn reset_window(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeadType, ModelConfig, ModelVariant};
    use crate::model::{FinetuneScope, TinyMae};
    use crate::training::optimizer::OptimizerKind;
    use ndarray::Array4;

    fn test_setup() -> (TinyMae, Optimizer, LossScaler) {
        let config = ModelConfig {
            variant: ModelVariant::Small,
            input_size: 32,
            channels: 1,
            num_classes: 4,
            head_type: HeadType::Linear,
            head_dropout: 0.0,
            norm_pix_loss: false,
        };
        let model = TinyMae::new(&config, 3).unwrap();
        let names = FinetuneScope::All.filter(&model.parameter_names());
        let optimizer = Optimizer::new(OptimizerKind::Sgd, 1e-3, 0.9, 0.0, names).unwrap();
        (model, optimizer, LossScaler::new())
    }

    fn views(fill: impl Fn(usize, usize) -> f32) -> Array4<f32> {
        Array4::from_shape_fn((1, 1, 32, 32), |(_, _, r, c)| fill(r, c))
    }

    #[test]
    fn boundaries_fire_every_accum_iter_calls() {
        let (mut model, mut optimizer, mut scaler) = test_setup();
        let mut unit = AdaptationUnit::new(0.75, 2).unwrap();
        let batch = views(|r, c| (r + c) as f32 / 64.0);

        let first = unit
            .micro_step(&mut model, &mut optimizer, &mut scaler, &batch, 0)
            .unwrap();
        assert!(!first.is_boundary());

        let second = unit
            .micro_step(&mut model, &mut optimizer, &mut scaler, &batch, 1)
            .unwrap();
        let mean = second.boundary_loss.unwrap();
        assert!((mean - (first.loss + second.loss) / 2.0).abs() < 1e-5);
    }

    #[test]
    fn non_finite_loss_is_fatal() {
        let (mut model, mut optimizer, mut scaler) = test_setup();
        let mut unit = AdaptationUnit::new(0.75, 1).unwrap();
        let poisoned = views(|_, _| f32::NAN);

        let err = unit
            .micro_step(&mut model, &mut optimizer, &mut scaler, &poisoned, 0)
            .unwrap_err();
        assert!(err.to_string().contains("stopping training"));
    }

    #[test]
    fn gradients_are_zeroed_at_boundaries() {
        let (mut model, mut optimizer, mut scaler) = test_setup();
        let mut unit = AdaptationUnit::new(0.75, 1).unwrap();
        let batch = views(|r, c| (r * 31 + c) as f32 / 991.0);

        unit.micro_step(&mut model, &mut optimizer, &mut scaler, &batch, 0)
            .unwrap();

        let names = model.parameter_names();
        let mut max_grad = 0.0f32;
        model
            .visit_trainable(&names, &mut |_, _, grads| {
                for &g in grads {
                    max_grad = max_grad.max(g.abs());
                }
            })
            .unwrap();
        assert_eq!(max_grad, 0.0);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(AdaptationUnit::new(1.0, 1).is_err());
        assert!(AdaptationUnit::new(0.5, 0).is_err());
    }
}
