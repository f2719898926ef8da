//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use ttt_mae::checkpoints::{self, num_parameters};
use ttt_mae::config::{Config, HeadType};
use ttt_mae::data::TensorFolder;
use ttt_mae::model::{FinetuneScope, TestTimeModel, TinyMae};
use ttt_mae::results::{self, npy};
use ttt_mae::training::Engine;

/// Every knob of one test-time-training pass.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Dataset root: one subdirectory of .npy tensors per class
    #[arg(long)]
    pub data_path: String,
    /// Where result segments and reports land
    #[arg(long, default_value = "output")]
    pub output_dir: String,
    /// Base model checkpoint (safetensors)
    #[arg(long)]
    pub model_checkpoint: String,
    /// Separate head checkpoint merged over the base weights
    #[arg(long)]
    pub head_checkpoint: Option<String>,
    /// File selecting a subset of image indices, one per line
    #[arg(long)]
    pub minimizer_file: Option<String>,
    /// Encoder preset: small, large, huge
    #[arg(long, default_value = "large")]
    pub model: String,
    /// Classification head: linear, vit_head
    #[arg(long, default_value = "vit_head")]
    pub head_type: String,
    #[arg(long, default_value = "0.0")]
    pub head_dropout: f32,
    /// Square input edge in pixels
    #[arg(long, default_value = "224")]
    pub input_size: usize,
    /// Normalize reconstruction targets per patch
    #[arg(long)]
    pub norm_pix_loss: bool,
    /// Fraction of patches hidden during adaptation
    #[arg(long, default_value = "0.75")]
    pub mask_ratio: f32,
    /// Optimizer steps per image (after the first one in online mode)
    #[arg(long, default_value = "1")]
    pub steps_per_example: usize,
    /// Optimizer steps for the first image of an online run
    #[arg(long, default_value = "250")]
    pub steps_first_example: usize,
    /// Micro-steps accumulated into one optimizer step
    #[arg(long, default_value = "1")]
    pub accum_iter: usize,
    /// Augmented views per micro-step
    #[arg(long, default_value = "1")]
    pub batch_size: usize,
    /// Carry weights across images instead of resetting
    #[arg(long)]
    pub online_ttt: bool,
    /// Shuffle image order (online mode)
    #[arg(long)]
    pub shuffle: bool,
    #[arg(long, default_value = "0")]
    pub shuffle_seed: u64,
    /// Online: full reset every N images (-1 disables)
    #[arg(long, default_value = "-1")]
    pub reinit_interval: i64,
    /// Online: start each image from the previous image's first step
    #[arg(long)]
    pub checkpoint_swap: bool,
    /// Seed the loss scaler from the scale stored in the checkpoint
    #[arg(long)]
    pub load_loss_scaler: bool,
    /// Parameters to adapt: all, encoder, encoder_no_cls_no_mask
    #[arg(long, default_value = "encoder")]
    pub finetune_mode: String,
    /// sgd, adam, adam_w
    #[arg(long, default_value = "sgd")]
    pub optimizer_type: String,
    #[arg(long, default_value = "0.9")]
    pub optimizer_momentum: f32,
    #[arg(long, default_value = "0.05")]
    pub weight_decay: f32,
    /// Base learning rate, scaled by effective batch size / 256
    #[arg(long, default_value = "1e-3")]
    pub blr: f32,
    /// Absolute learning rate; overrides --blr scaling
    #[arg(long)]
    pub lr: Option<f32>,
    #[arg(long, default_value = "0")]
    pub seed: u64,
    /// Deterministic center view instead of stochastic augmentation
    #[arg(long)]
    pub single_crop: bool,
    /// Gaussian jitter added to train views
    #[arg(long, default_value = "0.05")]
    pub jitter_std: f32,
    /// Prefetch worker threads
    #[arg(long, default_value = "1")]
    pub num_workers: usize,
    #[arg(long, default_value = "50")]
    pub print_freq: usize,
    /// Per-step loss prints
    #[arg(long)]
    pub verbose: bool,
    /// Dump reconstruction snapshots for every tenth image
    #[arg(long)]
    pub print_images: bool,
    #[arg(long, default_value = "5")]
    pub num_print_images: usize,
}

fn build_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::for_variant(&args.model)?;
    config.model.input_size = args.input_size;
    config.model.head_type = HeadType::from_name(&args.head_type)?;
    config.model.head_dropout = args.head_dropout;
    config.model.norm_pix_loss = args.norm_pix_loss;

    config.training.mask_ratio = args.mask_ratio;
    config.training.steps_per_example = args.steps_per_example;
    config.training.steps_first_example = args.steps_first_example;
    config.training.accum_iter = args.accum_iter;
    config.training.online = args.online_ttt;
    config.training.shuffle = args.shuffle;
    config.training.shuffle_seed = args.shuffle_seed;
    config.training.reinit_interval = args.reinit_interval;
    config.training.checkpoint_swap = args.checkpoint_swap;
    config.training.batch_size = args.batch_size;
    config.training.seed = args.seed;
    config.training.jitter_std = args.jitter_std;
    config.training.single_crop = args.single_crop;
    config.training.finetune_scope = FinetuneScope::from_name(&args.finetune_mode)?;
    config.training.load_loss_scaler = args.load_loss_scaler;
    config.training.num_workers = args.num_workers;
    config.training.print_freq = args.print_freq;
    config.training.verbose = args.verbose;
    config.training.print_images = args.print_images;
    config.training.num_print_images = args.num_print_images;

    config.optimizer.optimizer = args.optimizer_type.clone();
    config.optimizer.blr = args.blr;
    config.optimizer.lr = args.lr;
    config.optimizer.momentum = args.optimizer_momentum;
    config.optimizer.weight_decay = args.weight_decay;

    config.paths.data_dir = args.data_path.clone();
    config.paths.output_dir = args.output_dir.clone();
    config.paths.model_checkpoint = args.model_checkpoint.clone();
    config.paths.head_checkpoint = args.head_checkpoint.clone();
    config.paths.minimizer_file = args.minimizer_file.clone();

    Ok(config)
}

pub fn run(args: RunArgs) -> Result<()> {
    let mut config = build_config(&args)?;
    config.validate()?;

    let folder = Arc::new(
        TensorFolder::open(&config.paths.data_path())
            .with_context(|| format!("Failed to open dataset: {:?}", config.paths.data_path()))?,
    );
    // The dataset decides how many classes the head predicts over.
    config.model.num_classes = folder.num_classes();

    let (base_state, base_scale) = checkpoints::load_base_checkpoint(
        &config.paths.model_checkpoint_path(),
        config.paths.head_checkpoint_path().as_deref(),
        &["classifier.", "head."],
    )?;

    let mut model = TinyMae::new(&config.model, config.training.seed)?;
    model.load_state_dict(&base_state)?;
    println!(
        "Model = {} ({} parameters)",
        config.model.variant.as_str(),
        num_parameters(&base_state)
    );

    let eff_batch_size = config.training.batch_size * config.training.accum_iter;
    let actual_lr = config.effective_lr();
    println!("base lr: {:.2e}", actual_lr * 256.0 / eff_batch_size as f32);
    println!("actual lr: {:.2e}", actual_lr);
    println!("accumulate grad iterations: {}", config.training.accum_iter);
    println!("effective batch size: {}", eff_batch_size);

    let start = Instant::now();
    let engine = Engine::new(config, folder, Box::new(model), base_state, base_scale, None)?;
    let outcome = engine.run()?;

    let secs = start.elapsed().as_secs();
    println!(
        "Training time {}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    );
    if let Some(&last) = outcome.report.means.last() {
        println!(
            "Final offset accuracy over {} images: {:.2}%",
            outcome.report.images, last
        );
    }
    Ok(())
}

pub fn aggregate(output_dir: String, expected_images: Option<usize>) -> Result<()> {
    let dir = PathBuf::from(&output_dir);
    let report = results::aggregate(&dir, expected_images)?;
    let note = serde_json::json!({ "aggregate": output_dir }).to_string();
    results::write_accuracy_report(&dir, &note, &report)?;
    results::write_completion_sentinel(&dir)?;

    println!(
        "Aggregated {} images across {} offsets.",
        report.images,
        report.means.len()
    );
    for (offset, mean) in report.means.iter().enumerate() {
        println!("  offset {}: {:.2}%", offset, mean);
    }
    Ok(())
}

/// Synthesize a tiny class-striped dataset so a run can be smoke-tested
/// without real checkpoints or images.
pub fn make_data(
    output_dir: String,
    classes: usize,
    images_per_class: usize,
    input_size: usize,
    channels: usize,
    seed: u64,
) -> Result<()> {
    anyhow::ensure!(
        classes > 0 && images_per_class > 0,
        "need at least one class and one image per class"
    );
    let root = PathBuf::from(&output_dir);
    let mut rng = StdRng::seed_from_u64(seed);
    let noise =
        Normal::new(0.0f32, 0.1).map_err(|e| anyhow::anyhow!("noise distribution: {}", e))?;

    for class in 0..classes {
        let class_dir = root.join(format!("class_{:02}", class));
        std::fs::create_dir_all(&class_dir)
            .with_context(|| format!("Failed to create class directory: {:?}", class_dir))?;
        // One stripe frequency per class keeps the labels learnable.
        let frequency = (class + 1) as f32;
        for image in 0..images_per_class {
            let phase = rng.gen_range(0.0..std::f32::consts::TAU);
            let mut tensor = Array3::zeros((channels, input_size, input_size));
            for c in 0..channels {
                for y in 0..input_size {
                    for x in 0..input_size {
                        let angle =
                            frequency * std::f32::consts::TAU * (x as f32 / input_size as f32);
                        tensor[[c, y, x]] = (angle + phase).sin() * 0.5 + noise.sample(&mut rng);
                    }
                }
            }
            let path = class_dir.join(format!("img_{:03}.npy", image));
            npy::write_3d(&path, &tensor)
                .with_context(|| format!("Failed to write {:?}", path))?;
        }
    }
    println!(
        "Wrote {} images across {} classes under {:?}",
        classes * images_per_class,
        classes,
        root
    );
    Ok(())
}
