//! The run loop: adapt on each image, score it, persist, move on.
//!
//! One engine owns the model, the dataset handle, and the reset policy for
//! the lifetime of a run. The loop itself is the same for fixed-budget and
//! online runs; the step schedule and the reinitialization policy carry
//! the differences. Results land incrementally as `.npy` segments so an
//! interrupted run resumes after the last image it flushed.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array4, Axis};

use crate::checkpoints::{slot_path, CheckpointSlot, DiskSlot, ModelState};
use crate::config::Config;
use crate::data::{
    eval_view, load_minimizer, PlanEntry, Prefetcher, StepSchedule, TensorFolder,
};
use crate::metrics::RunMetrics;
use crate::model::{patches, TestTimeModel};
use crate::results::{self, npy, ResultBuffer};
use crate::training::adapt::{AdaptationUnit, MicroStep};
use crate::training::evaluate::EvaluationUnit;
use crate::training::reinit::ReinitializationPolicy;

/// Segment flush cadence, in images.
const FLUSH_INTERVAL: usize = 500;
/// Snapshot dumps cover every Nth image when enabled.
const SNAPSHOT_INTERVAL: usize = 10;

#[derive(Debug)]
pub struct RunOutcome {
    /// Images adapted in this invocation (resumed runs count only their own).
    pub images_processed: usize,
    /// Final per-offset accuracy means over the whole run.
    pub report: results::OffsetReport,
}

pub struct Engine {
    config: Config,
    folder: Arc<TensorFolder>,
    model: Box<dyn TestTimeModel>,
    policy: ReinitializationPolicy,
}

impl Engine {
    /// Wires the reset policy around a model already carrying the base
    /// checkpoint. `slot` overrides the default on-disk swap slot; pass
    /// `None` outside tests.
    pub fn new(
        config: Config,
        folder: Arc<TensorFolder>,
        model: Box<dyn TestTimeModel>,
        base_state: ModelState,
        base_scale: Option<f32>,
        slot: Option<Box<dyn CheckpointSlot>>,
    ) -> Result<Self> {
        config.validate()?;
        let output_dir = config.paths.output_path();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;

        let trainable = config
            .training
            .finetune_scope
            .filter(&model.parameter_names());
        let slot = if config.training.checkpoint_swap {
            Some(slot.unwrap_or_else(|| {
                Box::new(DiskSlot::new(slot_path(&output_dir))) as Box<dyn CheckpointSlot>
            }))
        } else {
            None
        };
        let policy =
            ReinitializationPolicy::new(&config, base_state, base_scale, trainable, slot)?;

        Ok(Self {
            config,
            folder,
            model,
            policy,
        })
    }

    /// Drive the whole run: resume detection, the adaptation loop, and the
    /// final aggregation pass.
    pub fn run(mut self) -> Result<RunOutcome> {
        let output_dir = self.config.paths.output_path();

        if self.config.training.online {
            println!("Running the online version of TTT.");
        }

        let iter_start = match results::resume_marker(&output_dir)? {
            Some(last) => {
                println!("Found {} values, continues from next iterations.", last);
                last + 1
            }
            None => 0,
        };

        if self.config.training.online && self.config.training.shuffle {
            println!(
                "Shuffling dataset with seed: {}",
                self.config.training.shuffle_seed
            );
            results::record_shuffle_seed(&output_dir, self.config.training.shuffle_seed)?;
        }

        let minimizer = match self.config.paths.minimizer_path() {
            Some(path) => Some(load_minimizer(&path)?),
            None => None,
        };
        let total_images = minimizer.as_ref().map_or(self.folder.len(), Vec::len);

        let mut images_processed = 0;
        let mut metrics = None;
        if iter_start < total_images {
            metrics = Some(self.run_images(iter_start, minimizer, &output_dir)?);
            images_processed = total_images - iter_start;
        }

        let report = results::aggregate(&output_dir, Some(total_images))?;
        results::write_accuracy_report(&output_dir, &self.config.summary_line()?, &report)?;
        results::write_completion_sentinel(&output_dir)?;
        if let Some(metrics) = metrics {
            metrics.print_summary();
        }

        Ok(RunOutcome {
            images_processed,
            report,
        })
    }

    fn run_images(
        &mut self,
        iter_start: usize,
        minimizer: Option<Vec<usize>>,
        output_dir: &Path,
    ) -> Result<RunMetrics> {
        let training = self.config.training.clone();
        let steps = training.steps_per_example;
        let accum = training.accum_iter;
        let folder_len = self.folder.len();
        let total_images = minimizer.as_ref().map_or(folder_len, Vec::len);
        let run_positions = total_images - iter_start;

        let schedule = if training.online {
            let base: Vec<usize> = match &minimizer {
                Some(subset) => subset.clone(),
                None => (0..folder_len).collect(),
            };
            let ordered = if training.shuffle {
                // Derive the run-wide permutation, then slice off what a
                // resumed run already covered.
                let permutation = StepSchedule::shuffled(
                    base.len(),
                    training.steps_first_example,
                    training.steps_per_example,
                    training.batch_size,
                    training.shuffle_seed,
                )?;
                let mut shuffled = Vec::with_capacity(base.len());
                for position in 0..base.len() {
                    shuffled.push(base[permutation.identity_at(position)?]);
                }
                shuffled
            } else {
                base
            };
            let remaining = ordered[iter_start..].to_vec();
            StepSchedule::variable(
                folder_len,
                training.steps_first_example,
                training.steps_per_example,
                training.batch_size,
                Some(remaining),
            )?
        } else {
            StepSchedule::uniform(
                folder_len,
                training.steps_per_example,
                training.batch_size,
                iter_start,
                minimizer,
            )?
        };

        let mut plan = Vec::with_capacity(run_positions);
        for position in 0..run_positions {
            plan.push(PlanEntry {
                position: iter_start + position,
                identity: schedule.identity_at(position)?,
                micro_steps: schedule.budget_at(position)? * accum,
            });
        }
        let mut prefetcher = Prefetcher::new(
            Arc::clone(&self.folder),
            plan,
            training.batch_size,
            training.jitter_std,
            training.single_crop,
            training.seed,
            training.num_workers,
        )?;

        if training.print_images {
            let snapshot_dir = output_dir.join(results::SNAPSHOT_DIR);
            std::fs::create_dir_all(&snapshot_dir).with_context(|| {
                format!("Failed to create snapshot directory: {:?}", snapshot_dir)
            })?;
        }

        let eval_unit = EvaluationUnit::new(accum)?;
        let mut adapt = AdaptationUnit::new(training.mask_ratio, accum)?;
        let (mut optimizer, mut scaler) = self.policy.full_reset(&mut *self.model)?;
        let mut outcomes = ResultBuffer::new(steps);
        let mut losses = ResultBuffer::new(steps);
        let mut metrics = RunMetrics::new();

        let pb = ProgressBar::new(run_positions as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ETA:{eta} {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        for position in 0..run_positions {
            let global_index = iter_start + position;
            let identity = schedule.identity_at(position)?;
            let budget = schedule.budget_at(position)?;
            let window = budget * accum;

            let label = self.folder.label_of(identity)?;
            let eval_views = eval_view(&self.folder.load_image(identity)?);

            self.policy.at_image_start(&mut *self.model, &mut optimizer)?;
            // Mask draws depend on the image position, not on run history,
            // so a resumed run replays an uninterrupted one.
            self.model.reseed(mask_seed(training.seed, global_index));

            let snapshot_at = if training.print_images && global_index % SNAPSHOT_INTERVAL == 0
            {
                snapshot_indices(window, training.num_print_images)
            } else {
                BTreeSet::new()
            };

            let mut image_outcomes = Vec::new();
            let mut image_losses = Vec::new();
            let mut boundary = 0usize;

            for micro in 0..window {
                let item = prefetcher.next()?;
                let step = adapt.micro_step(
                    &mut *self.model,
                    &mut optimizer,
                    &mut scaler,
                    &item.views,
                    micro,
                )?;

                if snapshot_at.contains(&micro) {
                    self.write_snapshot(
                        output_dir,
                        global_index,
                        micro,
                        &step,
                        &item.views,
                        micro + 1 == window,
                    )?;
                }

                let window_loss = match step.boundary_loss {
                    Some(loss) => loss,
                    None => continue,
                };
                if training.verbose {
                    println!(
                        "datapoint {} iter {}: rec_loss {}",
                        global_index, micro, step.loss
                    );
                }
                let offset = record_offset(training.online, position, steps, budget, boundary);
                if let Some(offset) = offset {
                    losses.record(offset, window_loss)?;
                }
                image_losses.push(window_loss);

                let verdict = eval_unit.evaluate(&mut *self.model, &eval_views, label)?;
                if training.verbose {
                    println!(
                        "datapoint {} iter {}: class_loss {}",
                        global_index, micro, verdict.class_loss
                    );
                }
                if let Some(offset) = offset {
                    outcomes.record(offset, verdict.outcome)?;
                    image_outcomes.push(verdict.outcome);
                }

                if boundary == 0 {
                    self.policy.after_first_boundary(&*self.model)?;
                }
                boundary += 1;
            }

            metrics.record_image(&image_outcomes, &image_losses);
            pb.set_message(format!(
                "loss: {:.4} | acc: {:.1}%",
                metrics.adapt_loss.mean(),
                metrics.final_accuracy.mean()
            ));

            if training.print_freq > 0 && global_index % training.print_freq == 1 {
                println!("{}", metrics.progress_line(position + 1, run_positions));
            }

            let is_last = position + 1 == run_positions;
            if global_index % FLUSH_INTERVAL == FLUSH_INTERVAL - 1 || is_last {
                results::flush_segment(output_dir, global_index, &mut outcomes, &mut losses)?;
            }

            if let Some((fresh_optimizer, fresh_scaler)) =
                self.policy.at_image_end(global_index + 1, &mut *self.model)?
            {
                optimizer = fresh_optimizer;
                scaler = fresh_scaler;
            }
            pb.inc(1);
        }
        pb.finish_with_message("Adaptation complete");

        Ok(metrics)
    }

    /// Dump the masked reconstruction (and, on the window's last step, the
    /// augmented original and its masked version) for offline inspection.
    fn write_snapshot(
        &self,
        output_dir: &Path,
        image_index: usize,
        micro_step: usize,
        step: &MicroStep,
        views: &Array4<f32>,
        is_final: bool,
    ) -> Result<()> {
        let (pred, mask) = match (&step.pred_patches, &step.mask) {
            (Some(pred), Some(mask)) => (pred, mask),
            _ => return Ok(()),
        };
        let patch = self.model.patch_size();
        let recon = self.model.unpatchify(pred)?;
        // Show the reconstruction only inside the masked holes.
        let visible = mask.mapv(|m| 1.0 - m);
        let framed = patches::apply_patch_mask(&recon, &visible, patch)?;
        npy::write_3d(
            &results::snapshot_path(output_dir, image_index, micro_step),
            &framed,
        )
        .context("Failed to write reconstruction snapshot")?;

        if is_final {
            let original = views.index_axis(Axis(0), 0).to_owned();
            npy::write_3d(
                &results::snapshot_original_path(output_dir, image_index),
                &original,
            )
            .context("Failed to write original snapshot")?;
            let masked = patches::apply_patch_mask(&original, mask, patch)?;
            npy::write_3d(
                &results::snapshot_masked_path(output_dir, image_index),
                &masked,
            )
            .context("Failed to write masked snapshot")?;
        }
        Ok(())
    }
}

/// Offset bucket for a boundary, or `None` while an online run's first
/// image is still outside the recorded tail.
///
/// The first image of an online run gets `budget > steps` boundaries but
/// only `steps` offset buckets exist, so only its last `steps` boundaries
/// are recorded, aligned so the final boundary lands at the last offset.
fn record_offset(
    online: bool,
    run_position: usize,
    steps: usize,
    budget: usize,
    boundary: usize,
) -> Option<usize> {
    if online && run_position == 0 {
        let remaining = budget - boundary;
        if remaining <= steps {
            Some(steps - remaining)
        } else {
            None
        }
    } else {
        Some(boundary)
    }
}

/// Per-image seed for the model's mask and dropout draws. Offset from the
/// view-seed stream so masks and augmentations stay uncorrelated.
fn mask_seed(seed: u64, image_index: usize) -> u64 {
    let spread = (image_index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (seed ^ 0xA076_1D64_78BD_642F).wrapping_add(spread)
}

/// Micro-step indices to dump: `count` points spread evenly over the
/// window, the final step always included.
fn snapshot_indices(window: usize, count: usize) -> BTreeSet<usize> {
    let mut set = BTreeSet::new();
    if window == 0 || count == 0 {
        return set;
    }
    let last = window - 1;
    if count > 1 {
        let span = last as f64 / (count - 1) as f64;
        for i in 0..count - 1 {
            set.insert((i as f64 * span).round() as usize);
        }
    }
    set.insert(last);
    set
}
