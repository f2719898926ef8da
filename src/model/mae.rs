//! Reference masked autoencoder with manual gradients.
//!
//! A deliberately small stand-in for the transformer: linear patch encoder,
//! learned mask token, linear decoder, and a classification head over
//! mean-pooled visible embeddings. It exists so the adaptation loop has a
//! real parameter set to optimize; anything implementing [`TestTimeModel`]
//! can replace it.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use ndarray::{Array1, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use super::patches;
use super::{ForwardPass, TestTimeModel};
use crate::checkpoints::{ModelState, TensorData};
use crate::config::{HeadType, ModelConfig};

const INIT_STD: f32 = 0.02;
const NORM_PIX_EPS: f32 = 1e-6;

struct LinearLayer {
    w: Array2<f32>,
    b: Array1<f32>,
    gw: Array2<f32>,
    gb: Array1<f32>,
}

impl LinearLayer {
    fn new(in_dim: usize, out_dim: usize, rng: &mut StdRng) -> Result<Self> {
        let normal = Normal::new(0.0, INIT_STD)
            .map_err(|e| anyhow!("bad init distribution: {e}"))?;
        let w = Array2::from_shape_fn((in_dim, out_dim), |_| normal.sample(rng));
        Ok(Self {
            w,
            b: Array1::zeros(out_dim),
            gw: Array2::zeros((in_dim, out_dim)),
            gb: Array1::zeros(out_dim),
        })
    }

    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut out = x.dot(&self.w);
        out += &self.b;
        out
    }

    fn zero_grads(&mut self) {
        self.gw.fill(0.0);
        self.gb.fill(0.0);
    }
}

enum Head {
    Linear(LinearLayer),
    Mlp { fc1: LinearLayer, fc2: LinearLayer },
}

struct ViewCache {
    patches: Array2<f32>,
    targets: Array2<f32>,
    mask: Vec<bool>,
    pre_act: Array2<f32>,
    activations: Array2<f32>,
    recon: Array2<f32>,
    num_masked: usize,
}

/// Linear masked autoencoder over [`ndarray`] tensors.
pub struct TinyMae {
    encoder: LinearLayer,
    mask_token: Array1<f32>,
    g_mask_token: Array1<f32>,
    decoder: LinearLayer,
    head: Head,
    patch_size: usize,
    num_patches: usize,
    patch_dim: usize,
    embed_dim: usize,
    num_classes: usize,
    norm_pix_loss: bool,
    head_dropout: f32,
    train_mode: bool,
    rng: StdRng,
    cache: Option<Vec<ViewCache>>,
}

impl TinyMae {
    pub fn new(config: &ModelConfig, seed: u64) -> Result<Self> {
        let patch_size = config.patch_size();
        if patch_size == 0 || config.input_size % patch_size != 0 {
            bail!(
                "input size {} is not divisible by patch size {}",
                config.input_size,
                patch_size
            );
        }
        if config.num_classes == 0 {
            bail!("model needs at least one class");
        }
        let grid = config.input_size / patch_size;
        let num_patches = grid * grid;
        let patch_dim = patch_size * patch_size * config.channels;
        let embed_dim = config.embed_dim();
        let mut rng = StdRng::seed_from_u64(seed);

        let encoder = LinearLayer::new(patch_dim, embed_dim, &mut rng)?;
        let decoder = LinearLayer::new(embed_dim, patch_dim, &mut rng)?;
        let normal = Normal::new(0.0, INIT_STD)
            .map_err(|e| anyhow!("bad init distribution: {e}"))?;
        let mask_token = Array1::from_shape_fn(embed_dim, |_| normal.sample(&mut rng));
        let head = match config.head_type {
            HeadType::Linear => Head::Linear(LinearLayer::new(
                embed_dim,
                config.num_classes,
                &mut rng,
            )?),
            HeadType::VitHead => Head::Mlp {
                fc1: LinearLayer::new(embed_dim, config.classifier_hidden(), &mut rng)?,
                fc2: LinearLayer::new(
                    config.classifier_hidden(),
                    config.num_classes,
                    &mut rng,
                )?,
            },
        };

        Ok(Self {
            encoder,
            g_mask_token: Array1::zeros(embed_dim),
            mask_token,
            decoder,
            head,
            patch_size,
            num_patches,
            patch_dim,
            embed_dim,
            num_classes: config.num_classes,
            norm_pix_loss: config.norm_pix_loss,
            head_dropout: config.head_dropout,
            train_mode: true,
            rng,
            cache: None,
        })
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    /// Random patch mask keeping `floor(L * (1 - ratio))` patches visible.
    fn sample_mask(&mut self, mask_ratio: f32) -> Vec<bool> {
        let len_keep = (self.num_patches as f32 * (1.0 - mask_ratio)) as usize;
        let mut order: Vec<usize> = (0..self.num_patches).collect();
        order.shuffle(&mut self.rng);
        let mut mask = vec![false; self.num_patches];
        for &patch in order.iter().skip(len_keep) {
            mask[patch] = true;
        }
        mask
    }

    fn normalized_targets(&self, patch_grid: &Array2<f32>) -> Array2<f32> {
        if !self.norm_pix_loss {
            return patch_grid.clone();
        }
        let mut targets = patch_grid.clone();
        for mut row in targets.rows_mut() {
            let mean = row.mean().unwrap_or(0.0);
            let var = row.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            let denom = (var + NORM_PIX_EPS).sqrt();
            row.mapv_inplace(|v| (v - mean) / denom);
        }
        targets
    }

    fn head_forward(&mut self, pooled: &Array1<f32>) -> Array1<f32> {
        let row = pooled.clone().insert_axis(Axis(0));
        let logits = match &self.head {
            Head::Linear(layer) => layer.forward(&row),
            Head::Mlp { fc1, fc2 } => {
                let mut hidden = fc1.forward(&row).mapv(|v| v.max(0.0));
                if self.train_mode && self.head_dropout > 0.0 {
                    let keep = 1.0 - self.head_dropout;
                    for v in hidden.iter_mut() {
                        if self.rng.gen::<f32>() < self.head_dropout {
                            *v = 0.0;
                        } else {
                            *v /= keep;
                        }
                    }
                }
                fc2.forward(&hidden)
            }
        };
        logits.row(0).to_owned()
    }

    fn cross_entropy(logits: &Array1<f32>, label: usize) -> f32 {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp_sum: f32 = logits.iter().map(|&v| (v - max).exp()).sum();
        let log_prob = logits[label] - max - exp_sum.ln();
        -log_prob
    }
}

impl TestTimeModel for TinyMae {
    fn forward(
        &mut self,
        views: &Array4<f32>,
        label: Option<usize>,
        mask_ratio: f32,
        reconstruct: bool,
    ) -> Result<ForwardPass> {
        let (batch, channels, height, width) = views.dim();
        if batch == 0 {
            bail!("forward needs at least one view");
        }
        let fits = channels * self.patch_size * self.patch_size == self.patch_dim
            && height % self.patch_size == 0
            && width % self.patch_size == 0
            && (height / self.patch_size) * (width / self.patch_size) == self.num_patches;
        if !fits {
            bail!(
                "view shape [{}, {}, {}] does not fit the configured patch grid",
                channels,
                height,
                width
            );
        }
        if !(0.0..1.0).contains(&mask_ratio) {
            bail!("mask_ratio {} must lie in [0, 1)", mask_ratio);
        }
        if let Some(class) = label {
            if class >= self.num_classes {
                bail!("label {} out of range for {} classes", class, self.num_classes);
            }
        }

        let mut recon_loss = 0.0;
        let mut class_loss = 0.0;
        let mut predictions = Array2::zeros((batch, self.num_classes));
        let mut first_recon = None;
        let mut first_mask = None;
        let mut caches = Vec::with_capacity(batch);

        for v in 0..batch {
            let image = views.index_axis(Axis(0), v).to_owned();
            let patch_grid = patches::patchify(&image, self.patch_size)?;
            let targets = self.normalized_targets(&patch_grid);

            let mask = if mask_ratio > 0.0 {
                self.sample_mask(mask_ratio)
            } else {
                vec![false; self.num_patches]
            };
            let num_masked = mask.iter().filter(|&&m| m).count();

            let mut pre_act = self.encoder.forward(&patch_grid);
            for (row, &masked) in mask.iter().enumerate() {
                if masked {
                    pre_act.row_mut(row).assign(&self.mask_token);
                }
            }
            let activations = pre_act.mapv(|z| z.max(0.0));

            // Pool over visible tokens; with mask ratio 0 that is every token.
            let visible = self.num_patches - num_masked;
            let mut pooled = Array1::zeros(self.embed_dim);
            for (row, &masked) in mask.iter().enumerate() {
                if !masked {
                    pooled += &activations.row(row);
                }
            }
            if visible > 0 {
                pooled /= visible as f32;
            }

            let logits = self.head_forward(&pooled);
            predictions.row_mut(v).assign(&logits);
            if let Some(class) = label {
                class_loss += Self::cross_entropy(&logits, class) / batch as f32;
            }

            if reconstruct {
                let recon = self.decoder.forward(&activations);
                if num_masked > 0 {
                    let mut view_loss = 0.0;
                    for (row, &masked) in mask.iter().enumerate() {
                        if masked {
                            let diff = &recon.row(row) - &targets.row(row);
                            view_loss += diff.mapv(|d| d * d).mean().unwrap_or(0.0);
                        }
                    }
                    recon_loss += view_loss / (num_masked as f32 * batch as f32);
                }
                if v == 0 {
                    first_recon = Some(recon.clone());
                    first_mask = Some(Array1::from_iter(
                        mask.iter().map(|&m| if m { 1.0 } else { 0.0 }),
                    ));
                }
                caches.push(ViewCache {
                    patches: patch_grid,
                    targets,
                    mask,
                    pre_act,
                    activations,
                    recon,
                    num_masked,
                });
            }
        }

        if reconstruct && self.train_mode {
            self.cache = Some(caches);
        }

        let mut losses = BTreeMap::new();
        if reconstruct {
            losses.insert("reconstruction".to_string(), recon_loss);
        }
        if label.is_some() {
            losses.insert("classification".to_string(), class_loss);
        }

        Ok(ForwardPass {
            losses,
            pred_patches: first_recon,
            predictions,
            mask: first_mask,
        })
    }

    fn backward(&mut self, scale: f32) -> Result<()> {
        let caches = self
            .cache
            .take()
            .context("backward without a pending reconstruction forward")?;
        let batch = caches.len() as f32;

        for view in &caches {
            if view.num_masked == 0 {
                continue;
            }
            let norm = scale * 2.0
                / (self.patch_dim as f32 * view.num_masked as f32 * batch);

            // d(loss)/d(recon), nonzero only on masked rows.
            let mut d_recon = Array2::zeros(view.recon.dim());
            for (row, &masked) in view.mask.iter().enumerate() {
                if masked {
                    let diff = &view.recon.row(row) - &view.targets.row(row);
                    d_recon.row_mut(row).assign(&diff.mapv(|d| d * norm));
                }
            }

            self.decoder.gw += &view.activations.t().dot(&d_recon);
            self.decoder.gb += &d_recon.sum_axis(Axis(0));

            let d_act = d_recon.dot(&self.decoder.w.t());
            let mut d_pre = d_act;
            for ((row, col), v) in d_pre.indexed_iter_mut() {
                if view.pre_act[[row, col]] <= 0.0 {
                    *v = 0.0;
                }
            }

            // Masked rows came from the mask token, visible rows from the
            // encoder.
            let mut d_visible = d_pre.clone();
            for (row, &masked) in view.mask.iter().enumerate() {
                if masked {
                    self.g_mask_token += &d_pre.row(row);
                    d_visible.row_mut(row).fill(0.0);
                }
            }
            self.encoder.gw += &view.patches.t().dot(&d_visible);
            self.encoder.gb += &d_visible.sum_axis(Axis(0));
        }
        Ok(())
    }

    fn zero_grads(&mut self) {
        self.encoder.zero_grads();
        self.decoder.zero_grads();
        self.g_mask_token.fill(0.0);
        match &mut self.head {
            Head::Linear(layer) => layer.zero_grads(),
            Head::Mlp { fc1, fc2 } => {
                fc1.zero_grads();
                fc2.zero_grads();
            }
        }
    }

    fn set_train(&mut self, train: bool) {
        self.train_mode = train;
    }

    fn is_train(&self) -> bool {
        self.train_mode
    }

    fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    fn state_dict(&self) -> ModelState {
        let mut state = ModelState::new();
        let mut put = |name: &str, data: Vec<f32>, shape: Vec<usize>| {
            // Shapes come from the arrays themselves, so this cannot fail.
            if let Ok(tensor) = TensorData::new(data, shape) {
                state.insert(name.to_string(), tensor);
            }
        };
        put(
            "encoder.weight",
            self.encoder.w.iter().copied().collect(),
            self.encoder.w.shape().to_vec(),
        );
        put(
            "encoder.bias",
            self.encoder.b.to_vec(),
            vec![self.encoder.b.len()],
        );
        put(
            "mask_token",
            self.mask_token.to_vec(),
            vec![self.mask_token.len()],
        );
        put(
            "decoder.weight",
            self.decoder.w.iter().copied().collect(),
            self.decoder.w.shape().to_vec(),
        );
        put(
            "decoder.bias",
            self.decoder.b.to_vec(),
            vec![self.decoder.b.len()],
        );
        match &self.head {
            Head::Linear(layer) => {
                put(
                    "head.weight",
                    layer.w.iter().copied().collect(),
                    layer.w.shape().to_vec(),
                );
                put("head.bias", layer.b.to_vec(), vec![layer.b.len()]);
            }
            Head::Mlp { fc1, fc2 } => {
                put(
                    "classifier.fc1.weight",
                    fc1.w.iter().copied().collect(),
                    fc1.w.shape().to_vec(),
                );
                put("classifier.fc1.bias", fc1.b.to_vec(), vec![fc1.b.len()]);
                put(
                    "classifier.fc2.weight",
                    fc2.w.iter().copied().collect(),
                    fc2.w.shape().to_vec(),
                );
                put("classifier.fc2.bias", fc2.b.to_vec(), vec![fc2.b.len()]);
            }
        }
        state
    }

    fn load_state_dict(&mut self, state: &ModelState) -> Result<()> {
        fn fetch<'a>(state: &'a ModelState, name: &str) -> Result<&'a TensorData> {
            state
                .get(name)
                .with_context(|| format!("state dict is missing tensor {:?}", name))
        }
        fn load2(target: &mut Array2<f32>, tensor: &TensorData, name: &str) -> Result<()> {
            if tensor.shape != target.shape() {
                bail!(
                    "tensor {:?} has shape {:?}, expected {:?}",
                    name,
                    tensor.shape,
                    target.shape()
                );
            }
            for (dst, src) in target.iter_mut().zip(&tensor.data) {
                *dst = *src;
            }
            Ok(())
        }
        fn load1(target: &mut Array1<f32>, tensor: &TensorData, name: &str) -> Result<()> {
            if tensor.shape != [target.len()] {
                bail!(
                    "tensor {:?} has shape {:?}, expected [{}]",
                    name,
                    tensor.shape,
                    target.len()
                );
            }
            for (dst, src) in target.iter_mut().zip(&tensor.data) {
                *dst = *src;
            }
            Ok(())
        }

        load2(&mut self.encoder.w, fetch(state, "encoder.weight")?, "encoder.weight")?;
        load1(&mut self.encoder.b, fetch(state, "encoder.bias")?, "encoder.bias")?;
        load1(&mut self.mask_token, fetch(state, "mask_token")?, "mask_token")?;
        load2(&mut self.decoder.w, fetch(state, "decoder.weight")?, "decoder.weight")?;
        load1(&mut self.decoder.b, fetch(state, "decoder.bias")?, "decoder.bias")?;
        match &mut self.head {
            Head::Linear(layer) => {
                load2(&mut layer.w, fetch(state, "head.weight")?, "head.weight")?;
                load1(&mut layer.b, fetch(state, "head.bias")?, "head.bias")?;
            }
            Head::Mlp { fc1, fc2 } => {
                load2(&mut fc1.w, fetch(state, "classifier.fc1.weight")?, "classifier.fc1.weight")?;
                load1(&mut fc1.b, fetch(state, "classifier.fc1.bias")?, "classifier.fc1.bias")?;
                load2(&mut fc2.w, fetch(state, "classifier.fc2.weight")?, "classifier.fc2.weight")?;
                load1(&mut fc2.b, fetch(state, "classifier.fc2.bias")?, "classifier.fc2.bias")?;
            }
        }
        self.cache = None;
        Ok(())
    }

    fn parameter_names(&self) -> Vec<String> {
        self.state_dict().keys().cloned().collect()
    }

    fn visit_trainable(
        &mut self,
        names: &[String],
        f: &mut dyn FnMut(&str, &mut [f32], &[f32]),
    ) -> Result<()> {
        fn visit2(
            name: &str,
            names: &[String],
            param: &mut Array2<f32>,
            grad: &Array2<f32>,
            f: &mut dyn FnMut(&str, &mut [f32], &[f32]),
        ) -> Result<()> {
            if !names.iter().any(|n| n == name) {
                return Ok(());
            }
            match (param.as_slice_mut(), grad.as_slice()) {
                (Some(p), Some(g)) => {
                    f(name, p, g);
                    Ok(())
                }
                _ => bail!("parameter {:?} storage is not contiguous", name),
            }
        }
        fn visit1(
            name: &str,
            names: &[String],
            param: &mut Array1<f32>,
            grad: &Array1<f32>,
            f: &mut dyn FnMut(&str, &mut [f32], &[f32]),
        ) -> Result<()> {
            if !names.iter().any(|n| n == name) {
                return Ok(());
            }
            match (param.as_slice_mut(), grad.as_slice()) {
                (Some(p), Some(g)) => {
                    f(name, p, g);
                    Ok(())
                }
                _ => bail!("parameter {:?} storage is not contiguous", name),
            }
        }

        visit2("encoder.weight", names, &mut self.encoder.w, &self.encoder.gw, f)?;
        visit1("encoder.bias", names, &mut self.encoder.b, &self.encoder.gb, f)?;
        visit1("mask_token", names, &mut self.mask_token, &self.g_mask_token, f)?;
        visit2("decoder.weight", names, &mut self.decoder.w, &self.decoder.gw, f)?;
        visit1("decoder.bias", names, &mut self.decoder.b, &self.decoder.gb, f)?;
        match &mut self.head {
            Head::Linear(layer) => {
                visit2("head.weight", names, &mut layer.w, &layer.gw, f)?;
                visit1("head.bias", names, &mut layer.b, &layer.gb, f)?;
            }
            Head::Mlp { fc1, fc2 } => {
                visit2("classifier.fc1.weight", names, &mut fc1.w, &fc1.gw, f)?;
                visit1("classifier.fc1.bias", names, &mut fc1.b, &fc1.gb, f)?;
                visit2("classifier.fc2.weight", names, &mut fc2.w, &fc2.gw, f)?;
                visit1("classifier.fc2.bias", names, &mut fc2.b, &fc2.gb, f)?;
            }
        }
        Ok(())
    }

    fn unpatchify(&self, patch_grid: &Array2<f32>) -> Result<Array3<f32>> {
        patches::unpatchify(patch_grid, self.patch_size)
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelVariant;

    fn test_config() -> ModelConfig {
        ModelConfig {
            variant: ModelVariant::Small,
            input_size: 32,
            channels: 1,
            num_classes: 4,
            head_type: HeadType::VitHead,
            head_dropout: 0.0,
            norm_pix_loss: false,
        }
    }

    fn test_views(batch: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, 1, 32, 32), |(b, _, h, w)| {
            ((b + 1) * (h + 2 * w)) as f32 / 1000.0
        })
    }

    #[test]
    fn forward_shapes_and_mask_count() {
        let mut model = TinyMae::new(&test_config(), 0).unwrap();
        let out = model.forward(&test_views(2), None, 0.75, true).unwrap();
        assert_eq!(out.predictions.dim(), (2, 4));
        let mask = out.mask.unwrap();
        assert_eq!(mask.len(), model.num_patches());
        let masked = mask.iter().filter(|&&m| m > 0.5).count();
        // 4 patches, keep floor(4 * 0.25) = 1
        assert_eq!(masked, 3);
        assert!(out.losses.contains_key("reconstruction"));
    }

    #[test]
    fn eval_forward_is_deterministic() {
        let mut model = TinyMae::new(&test_config(), 1).unwrap();
        model.set_train(false);
        let views = test_views(1);
        let a = model.forward(&views, Some(2), 0.0, false).unwrap();
        let b = model.forward(&views, Some(2), 0.0, false).unwrap();
        assert_eq!(a.predictions, b.predictions);
        assert!(a.losses.contains_key("classification"));
        assert!(!a.losses.contains_key("reconstruction"));
    }

    #[test]
    fn gradient_descent_reduces_reconstruction_loss() {
        let mut model = TinyMae::new(&test_config(), 2).unwrap();
        let views = test_views(1);
        let names = model.parameter_names();
        let mut first_loss = None;
        let mut last_loss = 0.0;
        for _ in 0..25 {
            let out = model.forward(&views, None, 0.5, true).unwrap();
            let loss = out.total_loss();
            first_loss.get_or_insert(loss);
            last_loss = loss;
            model.backward(1.0).unwrap();
            model
                .visit_trainable(&names, &mut |_, param, grad| {
                    for (p, g) in param.iter_mut().zip(grad) {
                        *p -= 0.05 * g;
                    }
                })
                .unwrap();
            model.zero_grads();
        }
        assert!(last_loss < first_loss.unwrap());
    }

    #[test]
    fn state_dict_round_trips_bitwise() {
        let config = test_config();
        let mut donor = TinyMae::new(&config, 3).unwrap();
        let mut receiver = TinyMae::new(&config, 4).unwrap();
        let state = donor.state_dict();
        receiver.load_state_dict(&state).unwrap();
        assert_eq!(receiver.state_dict(), state);
        assert_ne!(donor.state_dict(), TinyMae::new(&config, 4).unwrap().state_dict());
        // donor stays usable after exporting
        donor.forward(&test_views(1), None, 0.5, true).unwrap();
    }

    #[test]
    fn backward_requires_a_forward() {
        let mut model = TinyMae::new(&test_config(), 5).unwrap();
        assert!(model.backward(1.0).is_err());
    }

    #[test]
    fn scope_filters_parameter_names() {
        let model = TinyMae::new(&test_config(), 6).unwrap();
        let names = model.parameter_names();

        let no_tokens = crate::model::FinetuneScope::EncoderNoClsNoMask.filter(&names);
        assert!(no_tokens
            .iter()
            .all(|n| !n.starts_with("decoder.") && n != "mask_token"));
        // The classification head stays trainable; only the decoder side is
        // frozen.
        assert!(no_tokens.iter().any(|n| n.starts_with("classifier.")));

        let with_tokens = crate::model::FinetuneScope::Encoder.filter(&names);
        assert!(with_tokens.iter().any(|n| n == "mask_token"));
        assert!(!with_tokens.iter().any(|n| n.starts_with("decoder.")));
    }
}
