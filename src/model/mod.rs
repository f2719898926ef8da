//! Model seam: the call contract the training loop adapts against.

pub mod mae;
pub mod patches;

use std::collections::BTreeMap;

use anyhow::Result;
use ndarray::{Array1, Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

use crate::checkpoints::ModelState;

pub use mae::TinyMae;

/// Output of one forward pass over a batch of views.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    /// Loss components by name; the adaptation loss is their sum.
    pub losses: BTreeMap<String, f32>,
    /// Reconstructed patch grid of the first view, when reconstruction ran.
    pub pred_patches: Option<Array2<f32>>,
    /// Class logits per view, shape [batch, num_classes].
    pub predictions: Array2<f32>,
    /// Patch mask of the first view (1 = masked), when reconstruction ran.
    pub mask: Option<Array1<f32>>,
}

impl ForwardPass {
    /// Sum of all loss components.
    pub fn total_loss(&self) -> f32 {
        self.losses.values().sum()
    }

    /// Argmax class of one view's logits.
    pub fn predicted_class(&self, view: usize) -> Option<usize> {
        let row = self.predictions.row(view);
        let mut best: Option<(usize, f32)> = None;
        for (idx, &logit) in row.iter().enumerate() {
            match best {
                Some((_, top)) if logit <= top => {}
                _ => best = Some((idx, logit)),
            }
        }
        best.map(|(idx, _)| idx)
    }
}

/// Which parameters the optimizer may update. The reconstruction loss never
/// reaches the classification head, so freezing is about the decoder side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinetuneScope {
    /// Every parameter, decoder included.
    All,
    /// Everything but the decoder.
    Encoder,
    /// Everything but the decoder and the class and mask tokens.
    EncoderNoClsNoMask,
}

impl FinetuneScope {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "all" => Ok(FinetuneScope::All),
            "encoder" => Ok(FinetuneScope::Encoder),
            "encoder_no_cls_no_mask" => Ok(FinetuneScope::EncoderNoClsNoMask),
            other => anyhow::bail!(
                "Unknown finetune scope: {}. Available: all, encoder, encoder_no_cls_no_mask",
                other
            ),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinetuneScope::All => "all",
            FinetuneScope::Encoder => "encoder",
            FinetuneScope::EncoderNoClsNoMask => "encoder_no_cls_no_mask",
        }
    }

    pub fn selects(&self, name: &str) -> bool {
        match self {
            FinetuneScope::All => true,
            FinetuneScope::Encoder => !name.starts_with("decoder."),
            FinetuneScope::EncoderNoClsNoMask => {
                !name.starts_with("decoder.") && name != "cls_token" && name != "mask_token"
            }
        }
    }

    /// Parameter names the scope selects, in state-dict order.
    pub fn filter(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|n| self.selects(n))
            .cloned()
            .collect()
    }
}

/// The masked-autoencoder contract the run loop drives.
///
/// `forward` with a positive mask ratio and `reconstruct` set caches the
/// activations that a following `backward` consumes; gradients accumulate
/// in model-owned buffers until `zero_grads`. Evaluation forwards
/// (mask ratio 0, `reconstruct` off) leave no gradient state behind.
pub trait TestTimeModel {
    fn forward(
        &mut self,
        views: &Array4<f32>,
        label: Option<usize>,
        mask_ratio: f32,
        reconstruct: bool,
    ) -> Result<ForwardPass>;

    /// Accumulate gradients of `scale * reconstruction_loss` from the last
    /// reconstruction forward.
    fn backward(&mut self, scale: f32) -> Result<()>;

    fn zero_grads(&mut self);

    fn set_train(&mut self, train: bool);

    fn is_train(&self) -> bool;

    /// Reset the model's internal randomness (masking, dropout). Called
    /// once per image so a resumed run draws the same masks as an
    /// uninterrupted one.
    fn reseed(&mut self, seed: u64);

    fn state_dict(&self) -> ModelState;

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()>;

    /// Parameter names in state-dict order.
    fn parameter_names(&self) -> Vec<String>;

    /// Visit `(name, parameter, gradient)` for every parameter in `names`,
    /// as flat slices.
    fn visit_trainable(
        &mut self,
        names: &[String],
        f: &mut dyn FnMut(&str, &mut [f32], &[f32]),
    ) -> Result<()>;

    /// Invert patchify for snapshot dumps.
    fn unpatchify(&self, patch_grid: &Array2<f32>) -> Result<Array3<f32>>;

    fn patch_size(&self) -> usize;
}
