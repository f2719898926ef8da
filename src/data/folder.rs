//! ImageFolder-style dataset of `.npy` tensors.
//!
//! Layout: one subdirectory per class under the root, each holding image
//! tensors shaped [C, H, W]. Classes and files are sorted by name, so item
//! identities are stable across runs and processes.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use ndarray::Array3;

use crate::results::npy;

pub struct TensorFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, usize)>,
}

impl TensorFolder {
    pub fn open(root: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(root)
            .with_context(|| format!("Failed to read dataset root: {:?}", root))?;
        let mut classes: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();
        if classes.is_empty() {
            bail!("dataset root {:?} has no class directories", root);
        }

        let mut samples = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            let mut files: Vec<PathBuf> = std::fs::read_dir(&class_dir)
                .with_context(|| format!("Failed to read class directory: {:?}", class_dir))?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().map_or(false, |ext| ext == "npy"))
                .collect();
            files.sort();
            for path in files {
                samples.push((path, label));
            }
        }
        if samples.is_empty() {
            bail!("dataset root {:?} holds no .npy tensors", root);
        }

        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn label_of(&self, index: usize) -> Result<usize> {
        self.samples
            .get(index)
            .map(|(_, label)| *label)
            .with_context(|| format!("item {} out of range ({} items)", index, self.len()))
    }

    pub fn load_image(&self, index: usize) -> Result<Array3<f32>> {
        let (path, _) = self
            .samples
            .get(index)
            .with_context(|| format!("item {} out of range ({} items)", index, self.len()))?;
        npy::read_3d(path).with_context(|| format!("Failed to load image tensor: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn write_image(dir: &Path, class: &str, name: &str, fill: f32) {
        let class_dir = dir.join(class);
        std::fs::create_dir_all(&class_dir).unwrap();
        let image = Array3::from_elem((1, 4, 4), fill);
        npy::write_3d(&class_dir.join(name), &image).unwrap();
    }

    #[test]
    fn scans_classes_and_files_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        write_image(dir.path(), "dog", "b.npy", 2.0);
        write_image(dir.path(), "cat", "a.npy", 1.0);
        write_image(dir.path(), "dog", "a.npy", 3.0);

        let folder = TensorFolder::open(dir.path()).unwrap();
        assert_eq!(folder.classes(), &["cat".to_string(), "dog".to_string()]);
        assert_eq!(folder.len(), 3);
        assert_eq!(folder.label_of(0).unwrap(), 0);
        assert_eq!(folder.label_of(1).unwrap(), 1);
        assert_eq!(folder.load_image(1).unwrap()[[0, 0, 0]], 3.0);
        assert_eq!(folder.load_image(2).unwrap()[[0, 0, 0]], 2.0);
    }

    #[test]
    fn rejects_empty_roots() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TensorFolder::open(dir.path()).is_err());
        std::fs::create_dir(dir.path().join("empty_class")).unwrap();
        assert!(TensorFolder::open(dir.path()).is_err());
    }
}
