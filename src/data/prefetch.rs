//! Bounded prefetch queue for train views.
//!
//! The adaptation loop consumes augmented views strictly in schedule order.
//! With `num_workers > 0` a single background thread loads and augments
//! ahead of the consumer through a bounded channel; with `num_workers == 0`
//! the same stream is produced inline on demand. View randomness is seeded
//! per schedule position, so both modes and any resume point draw
//! identical views.

use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, Context, Result};
use ndarray::{Array3, Array4};

use crate::data::folder::TensorFolder;
use crate::data::transform::ViewSampler;

/// One schedule position to stream: which dataset item to load and how many
/// micro-step batches to draw from it.
#[derive(Debug, Clone, Copy)]
pub struct PlanEntry {
    pub position: usize,
    pub identity: usize,
    pub micro_steps: usize,
}

pub struct PrefetchItem {
    pub position: usize,
    pub micro_step: usize,
    pub views: Array4<f32>,
}

pub struct Prefetcher {
    source: Source,
}

enum Source {
    Inline(InlineState),
    Background {
        rx: Option<Receiver<Result<PrefetchItem>>>,
        worker: Option<JoinHandle<()>>,
    },
}

struct InlineState {
    folder: Arc<TensorFolder>,
    plan: Vec<PlanEntry>,
    batch: usize,
    jitter_std: f32,
    single_crop: bool,
    seed: u64,
    entry_idx: usize,
    step_in_entry: usize,
    current: Option<(Array3<f32>, ViewSampler)>,
}

impl Prefetcher {
    pub fn new(
        folder: Arc<TensorFolder>,
        plan: Vec<PlanEntry>,
        batch: usize,
        jitter_std: f32,
        single_crop: bool,
        seed: u64,
        num_workers: usize,
    ) -> Result<Self> {
        if batch == 0 {
            bail!("batch size must be > 0");
        }

        if num_workers == 0 {
            return Ok(Self {
                source: Source::Inline(InlineState {
                    folder,
                    plan,
                    batch,
                    jitter_std,
                    single_crop,
                    seed,
                    entry_idx: 0,
                    step_in_entry: 0,
                    current: None,
                }),
            });
        }

        // The stream is ordered, so one worker produces; extra workers only
        // deepen the queue.
        let depth = num_workers * 4;
        let (tx, rx) = sync_channel::<Result<PrefetchItem>>(depth);
        tracing::debug!(entries = plan.len(), depth, "spawning prefetch worker");
        let worker = std::thread::spawn(move || {
            for entry in plan {
                let image = match folder.load_image(entry.identity) {
                    Ok(image) => image,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let mut sampler =
                    ViewSampler::new(jitter_std, single_crop, view_seed(seed, entry.position));
                for micro_step in 0..entry.micro_steps {
                    let item = PrefetchItem {
                        position: entry.position,
                        micro_step,
                        views: sampler.train_views(&image, batch),
                    };
                    if tx.send(Ok(item)).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Self {
            source: Source::Background {
                rx: Some(rx),
                worker: Some(worker),
            },
        })
    }

    pub fn next(&mut self) -> Result<PrefetchItem> {
        match &mut self.source {
            Source::Inline(state) => state.next(),
            Source::Background { rx, .. } => {
                let rx = rx.as_ref().context("prefetch queue already closed")?;
                rx.recv().context("train view stream ended early")?
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        if let Source::Background { rx, worker } = &mut self.source {
            // Closing the receiver unblocks a worker waiting on a full queue.
            rx.take();
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl InlineState {
    fn next(&mut self) -> Result<PrefetchItem> {
        loop {
            let entry = match self.plan.get(self.entry_idx) {
                Some(entry) => *entry,
                None => bail!("train view stream exhausted"),
            };
            if self.step_in_entry == entry.micro_steps {
                self.entry_idx += 1;
                self.step_in_entry = 0;
                self.current = None;
                continue;
            }
            if self.current.is_none() {
                let image = self.folder.load_image(entry.identity)?;
                let sampler = ViewSampler::new(
                    self.jitter_std,
                    self.single_crop,
                    view_seed(self.seed, entry.position),
                );
                self.current = Some((image, sampler));
            }
            let (image, sampler) = self
                .current
                .as_mut()
                .context("prefetch cursor lost its image")?;
            let item = PrefetchItem {
                position: entry.position,
                micro_step: self.step_in_entry,
                views: sampler.train_views(image, self.batch),
            };
            self.step_in_entry += 1;
            return Ok(item);
        }
    }
}

fn view_seed(seed: u64, position: usize) -> u64 {
    seed ^ (position as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
