//! Class-per-directory image scanning.
//!
//! Expected structure:
//! ```text
//! training_data/
//! ├── Coccidiosis/
//! │   ├── cocci.0.jpg
//! │   └── ...
//! └── Healthy/
//!     └── ...
//! ```
//!
//! Classes are the sorted sub-directory names; files inside a class are
//! walked recursively in file-name order, so the sample order is stable
//! across runs and platforms.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chest_core::{Error, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Supported image file extensions
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Which part of a class directory to keep when a validation split is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    /// Files after the first `split * n` of each class
    Training,
    /// The first `split * n` files of each class
    Validation,
    /// Every file, split ignored
    All,
}

/// Image paths and labels found under a root directory.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    class_names: Vec<String>,
    samples: Vec<(PathBuf, usize)>,
}

impl ImageFolder {
    /// Scans `root`, keeping the requested subset of each class.
    pub fn scan(root: &Path, validation_split: f64, subset: Subset) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::NotFound(format!(
                "image directory {}",
                root.display()
            )));
        }
        if !(0.0..1.0).contains(&validation_split) {
            return Err(Error::InvalidArgument(format!(
                "validation split must be in [0, 1), got {validation_split}"
            )));
        }

        let mut class_names: Vec<String> = std::fs::read_dir(root)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(String::from))
            .collect();
        class_names.sort();

        if class_names.is_empty() {
            return Err(Error::Dataset(format!(
                "no class directories found in {}",
                root.display()
            )));
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let files = list_images(&root.join(class_name));
            let boundary = (validation_split * files.len() as f64) as usize;
            let kept = match subset {
                Subset::Training => &files[boundary..],
                Subset::Validation => &files[..boundary],
                Subset::All => &files[..],
            };
            debug!(
                "Class '{}': {} of {} images kept ({:?})",
                class_name,
                kept.len(),
                files.len(),
                subset
            );
            samples.extend(kept.iter().map(|path| (path.clone(), label)));
        }

        info!(
            "Found {} images belonging to {} classes in {}",
            samples.len(),
            class_names.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            class_names,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of images per class name
    pub fn class_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (_, label) in &self.samples {
            *counts.entry(self.class_names[*label].clone()).or_insert(0) += 1;
        }
        counts
    }
}

fn list_images(class_dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(class_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_image_file(path))
        .collect()
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch_images(dir: &Path, class: &str, count: usize) {
        let class_dir = dir.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        for i in 0..count {
            fs::write(class_dir.join(format!("img_{i:02}.jpg")), b"").unwrap();
        }
        fs::write(class_dir.join("notes.txt"), b"skip me").unwrap();
    }

    #[test]
    fn test_classes_sorted_and_labelled() -> Result<()> {
        let dir = tempdir().unwrap();
        touch_images(dir.path(), "Healthy", 3);
        touch_images(dir.path(), "Coccidiosis", 2);

        let folder = ImageFolder::scan(dir.path(), 0.0, Subset::All)?;
        assert_eq!(folder.class_names(), ["Coccidiosis", "Healthy"]);
        assert_eq!(folder.len(), 5);
        assert_eq!(folder.samples()[0].1, 0);
        assert_eq!(folder.samples()[4].1, 1);
        assert!(folder.samples()[0].0.ends_with("Coccidiosis/img_00.jpg"));
        Ok(())
    }

    #[test]
    fn test_validation_split_is_disjoint_and_ordered() -> Result<()> {
        let dir = tempdir().unwrap();
        touch_images(dir.path(), "Coccidiosis", 10);
        touch_images(dir.path(), "Healthy", 5);

        let train = ImageFolder::scan(dir.path(), 0.2, Subset::Training)?;
        let valid = ImageFolder::scan(dir.path(), 0.2, Subset::Validation)?;

        assert_eq!(valid.len(), 2 + 1);
        assert_eq!(train.len(), 8 + 4);
        assert!(valid.samples()[0].0.ends_with("Coccidiosis/img_00.jpg"));
        assert!(valid.samples()[1].0.ends_with("Coccidiosis/img_01.jpg"));
        for (path, _) in valid.samples() {
            assert!(!train.samples().iter().any(|(p, _)| p == path));
        }
        assert_eq!(train.class_counts()["Healthy"], 4);
        Ok(())
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        let result = ImageFolder::scan(&dir.path().join("missing"), 0.0, Subset::All);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_root_without_classes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("stray.jpg"), b"").unwrap();
        let result = ImageFolder::scan(dir.path(), 0.0, Subset::All);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }
}
