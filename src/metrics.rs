//! Running statistics reported while a run is in flight.

use std::time::Instant;

/// Streaming mean over f32 samples.
#[derive(Debug, Clone, Default)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Accuracy and loss aggregates across processed images.
pub struct RunMetrics {
    /// Outcomes at the first optimizer boundary of each image.
    pub first_step_accuracy: RunningMean,
    /// Outcomes after the full per-image budget.
    pub final_accuracy: RunningMean,
    /// Adaptation loss at every optimizer boundary.
    pub adapt_loss: RunningMean,
    started: Instant,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            first_step_accuracy: RunningMean::new(),
            final_accuracy: RunningMean::new(),
            adapt_loss: RunningMean::new(),
            started: Instant::now(),
        }
    }

    /// Fold in one image's per-offset outcomes (0 or 100) and boundary losses.
    pub fn record_image(&mut self, outcomes: &[f32], losses: &[f32]) {
        if let Some(&first) = outcomes.first() {
            self.first_step_accuracy.push(first);
        }
        if let Some(&last) = outcomes.last() {
            self.final_accuracy.push(last);
        }
        for &loss in losses {
            self.adapt_loss.push(loss);
        }
    }

    pub fn progress_line(&self, processed: usize, total: usize) -> String {
        format!(
            "image {}/{} loss {:.4} acc {:.2}% (first step {:.2}%)",
            processed,
            total,
            self.adapt_loss.mean(),
            self.final_accuracy.mean(),
            self.first_step_accuracy.mean()
        )
    }

    pub fn print_summary(&self) {
        println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("✓ Test-time training complete");
        println!("  Images processed:   {}", self.final_accuracy.count());
        println!("  First-step accuracy: {:.2}%", self.first_step_accuracy.mean());
        println!("  Final accuracy:      {:.2}%", self.final_accuracy.mean());
        println!("  Mean loss:          {:.4}", self.adapt_loss.mean());
        println!(
            "  Elapsed:            {}",
            format_elapsed(self.started.elapsed().as_secs())
        );
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_elapsed(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
