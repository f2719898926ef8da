//! Incremental result persistence.
//!
//! Outcomes and losses accumulate offset-major in memory, flush to
//! `results_<idx>.npy` / `losses_<idx>.npy` segments every few hundred
//! images, and are folded into a final per-offset accuracy report once the
//! run completes. Segment files double as the resume marker: a restarted
//! run continues after the highest flushed image index.

pub mod npy;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::Array2;

pub const RESULTS_PREFIX: &str = "results_";
pub const LOSSES_PREFIX: &str = "losses_";
pub const ACCURACY_FILE: &str = "accuracy.txt";
pub const COMPLETION_SENTINEL: &str = "model-final.pth";
pub const SHUFFLE_SEED_FILE: &str = "shuffling_seed.txt";
pub const SNAPSHOT_DIR: &str = "images_evolution";

/// Offset-major accumulator: one row per offset within the adaptation
/// window, one column per evaluated image.
#[derive(Debug, Clone)]
pub struct ResultBuffer {
    offsets: Vec<Vec<f32>>,
}

impl ResultBuffer {
    pub fn new(num_offsets: usize) -> Self {
        Self {
            offsets: vec![Vec::new(); num_offsets],
        }
    }

    pub fn num_offsets(&self) -> usize {
        self.offsets.len()
    }

    pub fn record(&mut self, offset: usize, value: f32) -> Result<()> {
        let count = self.offsets.len();
        match self.offsets.get_mut(offset) {
            Some(row) => {
                row.push(value);
                Ok(())
            }
            None => bail!("offset {} out of range ({} offsets)", offset, count),
        }
    }

    /// Images currently buffered, assuming rows filled evenly.
    pub fn width(&self) -> usize {
        self.offsets.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0
    }

    pub fn clear(&mut self) {
        for row in &mut self.offsets {
            row.clear();
        }
    }

    /// Dense [num_offsets, width] view; rows must be even.
    pub fn to_array(&self) -> Result<Array2<f32>> {
        let width = self.width();
        let mut array = Array2::zeros((self.offsets.len(), width));
        for (i, row) in self.offsets.iter().enumerate() {
            if row.len() != width {
                bail!(
                    "offset {} holds {} entries, expected {}",
                    i,
                    row.len(),
                    width
                );
            }
            for (j, &value) in row.iter().enumerate() {
                array[[i, j]] = value;
            }
        }
        Ok(array)
    }
}

pub fn results_path(output_dir: &Path, image_index: usize) -> PathBuf {
    output_dir.join(format!("{}{}.npy", RESULTS_PREFIX, image_index))
}

pub fn losses_path(output_dir: &Path, image_index: usize) -> PathBuf {
    output_dir.join(format!("{}{}.npy", LOSSES_PREFIX, image_index))
}

pub fn snapshot_path(output_dir: &Path, image_index: usize, micro_step: usize) -> PathBuf {
    output_dir
        .join(SNAPSHOT_DIR)
        .join(format!("img{:06}_step{:05}.npy", image_index, micro_step))
}

pub fn snapshot_original_path(output_dir: &Path, image_index: usize) -> PathBuf {
    output_dir
        .join(SNAPSHOT_DIR)
        .join(format!("img{:06}_original.npy", image_index))
}

pub fn snapshot_masked_path(output_dir: &Path, image_index: usize) -> PathBuf {
    output_dir
        .join(SNAPSHOT_DIR)
        .join(format!("img{:06}_masked.npy", image_index))
}

/// Write both buffers as segment files keyed by the last image they cover,
/// then clear them.
pub fn flush_segment(
    output_dir: &Path,
    image_index: usize,
    outcomes: &mut ResultBuffer,
    losses: &mut ResultBuffer,
) -> Result<()> {
    let outcome_array = outcomes.to_array()?;
    let loss_array = losses.to_array()?;
    npy::write_2d(&results_path(output_dir, image_index), &outcome_array)
        .with_context(|| format!("Failed to flush results segment {}", image_index))?;
    npy::write_2d(&losses_path(output_dir, image_index), &loss_array)
        .with_context(|| format!("Failed to flush losses segment {}", image_index))?;
    outcomes.clear();
    losses.clear();
    Ok(())
}

fn segment_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix(RESULTS_PREFIX)?
        .strip_suffix(".npy")?
        .parse()
        .ok()
}

/// Sorted image indices of the flushed result segments.
pub fn segment_indices(output_dir: &Path) -> Result<Vec<usize>> {
    let mut indices = Vec::new();
    let entries = match std::fs::read_dir(output_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("Failed to scan output directory: {:?}", output_dir))
        }
    };
    for entry in entries {
        let entry = entry?;
        if let Some(index) = segment_index(&entry.file_name().to_string_lossy()) {
            indices.push(index);
        }
    }
    indices.sort_unstable();
    Ok(indices)
}

/// Highest image index covered by a flushed segment, if any.
pub fn resume_marker(output_dir: &Path) -> Result<Option<usize>> {
    Ok(segment_indices(output_dir)?.into_iter().max())
}

/// Per-offset accuracy means over every flushed segment.
#[derive(Debug)]
pub struct OffsetReport {
    pub means: Vec<f32>,
    pub images: usize,
}

/// Fold all result segments into per-offset means.
///
/// Every offset must recover the same sample count, and the count must
/// match `expected_images` when given. Either mismatch aborts rather than
/// averaging over silently missing data.
pub fn aggregate(output_dir: &Path, expected_images: Option<usize>) -> Result<OffsetReport> {
    let indices = segment_indices(output_dir)?;
    if indices.is_empty() {
        bail!(
            "no {}*.npy segments under {:?}; nothing to aggregate",
            RESULTS_PREFIX,
            output_dir
        );
    }

    let mut sums: Vec<f64> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    for index in &indices {
        let path = results_path(output_dir, *index);
        let segment = npy::read_2d(&path)
            .with_context(|| format!("Failed to read results segment: {:?}", path))?;
        let (offsets, width) = segment.dim();
        if sums.is_empty() {
            sums = vec![0.0; offsets];
            counts = vec![0; offsets];
        } else if sums.len() != offsets {
            bail!(
                "segment {} holds {} offsets, earlier segments hold {}",
                index,
                offsets,
                sums.len()
            );
        }
        for i in 0..offsets {
            for j in 0..width {
                sums[i] += segment[[i, j]] as f64;
            }
            counts[i] += width;
        }
    }

    let recovered = counts.first().copied().unwrap_or(0);
    for (i, &count) in counts.iter().enumerate() {
        if count != recovered {
            bail!(
                "offset {} recovered {} samples, offset 0 recovered {}",
                i,
                count,
                recovered
            );
        }
    }
    if let Some(expected) = expected_images {
        if recovered != expected {
            bail!(
                "recovered {} samples per offset, expected {}",
                recovered,
                expected
            );
        }
    }

    let means = sums
        .iter()
        .map(|&sum| (sum / recovered.max(1) as f64) as f32)
        .collect();
    Ok(OffsetReport {
        means,
        images: recovered,
    })
}

/// Append one run's report block to `accuracy.txt`.
pub fn write_accuracy_report(
    output_dir: &Path,
    config_line: &str,
    report: &OffsetReport,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory: {:?}", output_dir))?;
    let path = output_dir.join(ACCURACY_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open accuracy report: {:?}", path))?;
    writeln!(file, "# {}", chrono::Utc::now().to_rfc3339())?;
    writeln!(file, "{}", config_line)?;
    for (offset, mean) in report.means.iter().enumerate() {
        writeln!(file, "{}\t{}", offset, mean)?;
    }
    Ok(())
}

/// Drop the completion sentinel a finished run leaves behind.
pub fn write_completion_sentinel(output_dir: &Path) -> Result<()> {
    let path = output_dir.join(COMPLETION_SENTINEL);
    std::fs::write(&path, "Done!\n")
        .with_context(|| format!("Failed to write completion sentinel: {:?}", path))
}

pub fn completion_sentinel_exists(output_dir: &Path) -> bool {
    output_dir.join(COMPLETION_SENTINEL).exists()
}

pub fn record_shuffle_seed(output_dir: &Path, seed: u64) -> Result<()> {
    let path = output_dir.join(SHUFFLE_SEED_FILE);
    std::fs::write(&path, format!("shuffle_seed: {}\n", seed))
        .with_context(|| format!("Failed to record shuffle seed: {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_from(rows: &[&[f32]]) -> ResultBuffer {
        let mut buffer = ResultBuffer::new(rows.len());
        for (offset, row) in rows.iter().enumerate() {
            for &value in *row {
                buffer.record(offset, value).unwrap();
            }
        }
        buffer
    }

    #[test]
    fn buffer_is_offset_major() {
        let buffer = buffer_from(&[&[1.0, 2.0], &[3.0, 4.0]]);
        let array = buffer.to_array().unwrap();
        assert_eq!(array.dim(), (2, 2));
        assert_eq!(array[[0, 1]], 2.0);
        assert_eq!(array[[1, 0]], 3.0);
    }

    #[test]
    fn ragged_rows_refuse_to_densify() {
        let mut buffer = buffer_from(&[&[1.0, 2.0], &[3.0]]);
        assert!(buffer.to_array().is_err());
        assert!(buffer.record(5, 0.0).is_err());
    }

    #[test]
    fn flush_names_segments_by_image_index_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let mut outcomes = buffer_from(&[&[100.0], &[0.0]]);
        let mut losses = buffer_from(&[&[0.5], &[0.25]]);
        flush_segment(dir.path(), 499, &mut outcomes, &mut losses).unwrap();

        assert!(results_path(dir.path(), 499).exists());
        assert!(losses_path(dir.path(), 499).exists());
        assert!(outcomes.is_empty());
        assert!(losses.is_empty());
        assert_eq!(resume_marker(dir.path()).unwrap(), Some(499));
    }

    #[test]
    fn resume_marker_takes_the_highest_segment() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resume_marker(dir.path()).unwrap(), None);
        for index in [499, 999, 42] {
            let mut outcomes = buffer_from(&[&[100.0]]);
            let mut losses = buffer_from(&[&[0.1]]);
            flush_segment(dir.path(), index, &mut outcomes, &mut losses).unwrap();
        }
        assert_eq!(resume_marker(dir.path()).unwrap(), Some(999));
        assert_eq!(segment_indices(dir.path()).unwrap(), vec![42, 499, 999]);
    }

    #[test]
    fn aggregate_means_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut a_out = buffer_from(&[&[100.0, 0.0], &[100.0, 100.0]]);
        let mut a_loss = buffer_from(&[&[0.5, 0.5], &[0.4, 0.4]]);
        flush_segment(dir.path(), 1, &mut a_out, &mut a_loss).unwrap();
        let mut b_out = buffer_from(&[&[0.0], &[100.0]]);
        let mut b_loss = buffer_from(&[&[0.3], &[0.2]]);
        flush_segment(dir.path(), 2, &mut b_out, &mut b_loss).unwrap();

        let report = aggregate(dir.path(), Some(3)).unwrap();
        assert_eq!(report.images, 3);
        assert!((report.means[0] - 100.0 / 3.0).abs() < 1e-4);
        assert_eq!(report.means[1], 100.0);
    }

    #[test]
    fn aggregate_rejects_count_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let mut outcomes = buffer_from(&[&[100.0, 0.0]]);
        let mut losses = buffer_from(&[&[0.1, 0.2]]);
        flush_segment(dir.path(), 1, &mut outcomes, &mut losses).unwrap();

        assert!(aggregate(dir.path(), Some(5)).is_err());
        assert!(aggregate(dir.path(), Some(2)).is_ok());
    }

    #[test]
    fn aggregate_requires_segments() {
        let dir = tempfile::tempdir().unwrap();
        let err = aggregate(dir.path(), None).unwrap_err().to_string();
        assert!(err.contains("nothing to aggregate"));
    }

    #[test]
    fn accuracy_report_appends_config_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let report = OffsetReport {
            means: vec![50.0, 75.0],
            images: 4,
        };
        write_accuracy_report(dir.path(), "{\"run\":1}", &report).unwrap();
        write_accuracy_report(dir.path(), "{\"run\":2}", &report).unwrap();

        let text = std::fs::read_to_string(dir.path().join(ACCURACY_FILE)).unwrap();
        assert!(text.contains("{\"run\":1}"));
        assert!(text.contains("{\"run\":2}"));
        assert!(text.contains("0\t50"));
        assert!(text.contains("1\t75"));
    }

    #[test]
    fn sentinel_and_seed_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!completion_sentinel_exists(dir.path()));
        write_completion_sentinel(dir.path()).unwrap();
        assert!(completion_sentinel_exists(dir.path()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(COMPLETION_SENTINEL)).unwrap(),
            "Done!\n"
        );

        record_shuffle_seed(dir.path(), 77).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join(SHUFFLE_SEED_FILE)).unwrap(),
            "shuffle_seed: 77\n"
        );
    }
}
