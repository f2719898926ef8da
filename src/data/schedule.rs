//! Step schedules: mapping the flat virtual-step stream onto dataset items.
//!
//! A schedule assigns every item a step budget (in optimizer steps) and
//! answers which item a given virtual step belongs to. Budgets are positional: the
//! first processed position carries the long budget in variable mode, no
//! matter how identities are permuted.

use std::path::Path;

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("virtual step {step} is past the end of the schedule ({total} steps)")]
    Exhausted { step: usize, total: usize },

    #[error("position {position} is past the end of the schedule ({count} positions)")]
    PositionOutOfRange { position: usize, count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Uniform,
    Variable,
    Shuffled,
}

/// Immutable lookup table from virtual steps to item identities.
#[derive(Debug, Clone)]
pub struct StepSchedule {
    mode: Mode,
    /// Step budget per processing position.
    budgets: Vec<usize>,
    /// Running sums of `budgets`; final entry is the step total.
    cumulative: Vec<usize>,
    /// Processing position -> item identity (variable/shuffled modes).
    order: Vec<usize>,
    batch_size: usize,
    base_steps: usize,
    start_index: usize,
    minimizer: Option<Vec<usize>>,
    num_items: usize,
}

impl StepSchedule {
    /// Every item gets `base_steps` steps. Lookup divides the raw virtual
    /// step by `base_steps` directly, then applies `start_index` and the
    /// minimizer remap.
    pub fn uniform(
        num_items: usize,
        base_steps: usize,
        batch_size: usize,
        start_index: usize,
        minimizer: Option<Vec<usize>>,
    ) -> Result<Self> {
        validate_common(num_items, batch_size)?;
        if base_steps == 0 {
            bail!("base_steps must be at least 1");
        }
        validate_minimizer(&minimizer, num_items)?;
        let count = minimizer.as_ref().map_or(num_items, Vec::len);
        let budgets = vec![base_steps; count];
        let cumulative = cumsum(&budgets);
        Ok(Self {
            mode: Mode::Uniform,
            budgets,
            cumulative,
            order: Vec::new(),
            batch_size,
            base_steps,
            start_index,
            minimizer,
            num_items,
        })
    }

    /// The first position gets `first_steps` steps, every later one
    /// `subsequent_steps`. Lookup divides the virtual step by the batch
    /// size, then binary-searches the cumulative table.
    pub fn variable(
        num_items: usize,
        first_steps: usize,
        subsequent_steps: usize,
        batch_size: usize,
        minimizer: Option<Vec<usize>>,
    ) -> Result<Self> {
        validate_common(num_items, batch_size)?;
        validate_budgets(first_steps, subsequent_steps)?;
        validate_minimizer(&minimizer, num_items)?;
        let order: Vec<usize> = match &minimizer {
            Some(selected) => selected.clone(),
            None => (0..num_items).collect(),
        };
        let budgets = positional_budgets(order.len(), first_steps, subsequent_steps);
        let cumulative = cumsum(&budgets);
        Ok(Self {
            mode: Mode::Variable,
            budgets,
            cumulative,
            order,
            batch_size,
            base_steps: 0,
            start_index: 0,
            minimizer,
            num_items,
        })
    }

    /// Variable budgets over a seeded permutation of item identities.
    pub fn shuffled(
        num_items: usize,
        first_steps: usize,
        subsequent_steps: usize,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        validate_common(num_items, batch_size)?;
        validate_budgets(first_steps, subsequent_steps)?;
        let mut order: Vec<usize> = (0..num_items).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let budgets = positional_budgets(num_items, first_steps, subsequent_steps);
        let cumulative = cumsum(&budgets);
        Ok(Self {
            mode: Mode::Shuffled,
            budgets,
            cumulative,
            order,
            batch_size,
            base_steps: 0,
            start_index: 0,
            minimizer: None,
            num_items,
        })
    }

    /// Total virtual steps: step total times the batch multiplier.
    pub fn total_virtual_steps(&self) -> usize {
        let micro = self.cumulative.last().copied().unwrap_or(0);
        micro * self.batch_size
    }

    /// Number of processing positions in the schedule.
    pub fn num_positions(&self) -> usize {
        self.budgets.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Item identity that `virtual_step` trains on.
    ///
    /// Quotients sitting exactly on a cumulative boundary belong to the
    /// next item (the `side="right"` rule).
    pub fn item_for(&self, virtual_step: usize) -> Result<usize, ScheduleError> {
        let total = self.total_virtual_steps();
        if virtual_step >= total {
            return Err(ScheduleError::Exhausted {
                step: virtual_step,
                total,
            });
        }
        match self.mode {
            Mode::Uniform => {
                let position = virtual_step / self.base_steps;
                self.resolve_uniform(position, virtual_step, total)
            }
            Mode::Variable | Mode::Shuffled => {
                let quotient = virtual_step / self.batch_size;
                let position = self.cumulative.partition_point(|&c| c <= quotient);
                if position >= self.order.len() {
                    return Err(ScheduleError::Exhausted {
                        step: virtual_step,
                        total,
                    });
                }
                Ok(self.order[position])
            }
        }
    }

    /// Step budget of a processing position.
    pub fn budget_at(&self, position: usize) -> Result<usize, ScheduleError> {
        self.budgets
            .get(position)
            .copied()
            .ok_or(ScheduleError::PositionOutOfRange {
                position,
                count: self.budgets.len(),
            })
    }

    /// Item identity processed at a position.
    pub fn identity_at(&self, position: usize) -> Result<usize, ScheduleError> {
        match self.mode {
            Mode::Uniform => {
                let count = self.budgets.len();
                if position >= count {
                    return Err(ScheduleError::PositionOutOfRange { position, count });
                }
                let total = self.total_virtual_steps();
                self.resolve_uniform(position, position * self.base_steps, total)
            }
            Mode::Variable | Mode::Shuffled => self.order.get(position).copied().ok_or(
                ScheduleError::PositionOutOfRange {
                    position,
                    count: self.order.len(),
                },
            ),
        }
    }

    /// First virtual step of a position's window.
    pub fn window_start(&self, position: usize) -> Result<usize, ScheduleError> {
        let count = self.budgets.len();
        if position >= count {
            return Err(ScheduleError::PositionOutOfRange { position, count });
        }
        let micro_before = if position == 0 {
            0
        } else {
            self.cumulative[position - 1]
        };
        Ok(match self.mode {
            Mode::Uniform => position * self.base_steps,
            Mode::Variable | Mode::Shuffled => micro_before * self.batch_size,
        })
    }

    fn resolve_uniform(
        &self,
        position: usize,
        virtual_step: usize,
        total: usize,
    ) -> Result<usize, ScheduleError> {
        let shifted = position + self.start_index;
        match &self.minimizer {
            Some(selected) => selected.get(shifted).copied().ok_or(ScheduleError::Exhausted {
                step: virtual_step,
                total,
            }),
            None => {
                if shifted < self.num_items {
                    Ok(shifted)
                } else {
                    Err(ScheduleError::Exhausted {
                        step: virtual_step,
                        total,
                    })
                }
            }
        }
    }
}

/// Read a minimizer subset: one dataset index per line, blank lines skipped.
pub fn load_minimizer(path: &Path) -> Result<Vec<usize>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read minimizer file: {:?}", path))?;
    let mut indices = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let index: usize = line.parse().with_context(|| {
            format!("bad index {:?} on line {} of {:?}", line, line_no + 1, path)
        })?;
        indices.push(index);
    }
    if indices.is_empty() {
        bail!("minimizer file {:?} lists no indices", path);
    }
    Ok(indices)
}

fn positional_budgets(count: usize, first_steps: usize, subsequent_steps: usize) -> Vec<usize> {
    let mut budgets = vec![subsequent_steps; count];
    budgets[0] = first_steps;
    budgets
}

fn cumsum(budgets: &[usize]) -> Vec<usize> {
    let mut running = 0;
    budgets
        .iter()
        .map(|b| {
            running += b;
            running
        })
        .collect()
}

fn validate_common(num_items: usize, batch_size: usize) -> Result<()> {
    if num_items == 0 {
        bail!("schedule needs at least one item");
    }
    if batch_size == 0 {
        bail!("batch_size must be at least 1");
    }
    Ok(())
}

fn validate_budgets(first_steps: usize, subsequent_steps: usize) -> Result<()> {
    if first_steps == 0 || subsequent_steps == 0 {
        bail!("step budgets must be at least 1");
    }
    Ok(())
}

fn validate_minimizer(minimizer: &Option<Vec<usize>>, num_items: usize) -> Result<()> {
    if let Some(selected) = minimizer {
        if selected.is_empty() {
            bail!("minimizer subset must not be empty");
        }
        if let Some(&bad) = selected.iter().find(|&&idx| idx >= num_items) {
            bail!(
                "minimizer index {} is out of range for {} items",
                bad,
                num_items
            );
        }
    }
    Ok(())
}
