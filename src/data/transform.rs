//! Stochastic train-time augmentation.
//!
//! Each adaptation micro-step consumes a batch of augmented views of the
//! current image: a coin-flip horizontal mirror plus light Gaussian jitter.
//! Evaluation always sees the raw tensor.

use ndarray::{s, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

pub struct ViewSampler {
    jitter_std: f32,
    single_crop: bool,
    rng: StdRng,
}

impl ViewSampler {
    pub fn new(jitter_std: f32, single_crop: bool, seed: u64) -> Self {
        Self {
            jitter_std,
            single_crop,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws `batch` train views stacked as [B, C, H, W].
    ///
    /// With `single_crop` set, one view is drawn and repeated across the
    /// batch so every gradient in the step sees the same pixels.
    pub fn train_views(&mut self, image: &Array3<f32>, batch: usize) -> Array4<f32> {
        let (c, h, w) = image.dim();
        let mut views = Array4::zeros((batch, c, h, w));
        if self.single_crop {
            let view = self.draw_view(image);
            for b in 0..batch {
                views.index_axis_mut(Axis(0), b).assign(&view);
            }
        } else {
            for b in 0..batch {
                views.index_axis_mut(Axis(0), b).assign(&self.draw_view(image));
            }
        }
        views
    }

    fn draw_view(&mut self, image: &Array3<f32>) -> Array3<f32> {
        let mut view = if self.rng.gen_bool(0.5) {
            hflip(image)
        } else {
            image.clone()
        };
        if self.jitter_std > 0.0 {
            // Normal::new only fails on a non-finite std, screened above.
            if let Ok(noise) = Normal::new(0.0f32, self.jitter_std) {
                view.mapv_inplace(|v| v + noise.sample(&mut self.rng));
            }
        }
        view
    }
}

/// The deterministic single-view batch used for evaluation passes.
pub fn eval_view(image: &Array3<f32>) -> Array4<f32> {
    image.clone().insert_axis(Axis(0))
}

fn hflip(image: &Array3<f32>) -> Array3<f32> {
    image.slice(s![.., .., ..;-1]).to_owned()
}
