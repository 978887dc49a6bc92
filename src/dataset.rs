use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{BowErr, BowResult};

/// File extensions accepted as images when walking class folders.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Fixed directory that image references are relative to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataRoot(PathBuf);

impl DataRoot {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self(path.into())
    }

    /// Resolve an image reference. Absolute paths are returned untouched.
    pub fn join<P: AsRef<Path>>(&self, relative: P) -> PathBuf {
        self.0.join(relative)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Default for DataRoot {
    fn default() -> Self {
        Self::new("../data/MIT_split")
    }
}

/// Image references of one split, organised on disk as `<split>/<class>/<image>`.
///
/// `filenames[i]` is relative to the data root the split was read from and
/// `labels[i]` is the name of its class folder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub filenames: Vec<PathBuf>,
    pub labels: Vec<String>,
}

impl Dataset {
    /// Enumerate `root/split`. Classes and files are sorted by name so that
    /// repeated runs see the same order.
    pub fn read_split<P: AsRef<Path>>(root: &DataRoot, split: P) -> BowResult<Self> {
        let split = split.as_ref();
        let mut dataset = Self::default();
        for class in class_dirs(&root.join(split))? {
            let name = match class.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_owned(),
                None => continue,
            };
            for file in image_files(&class)? {
                if let Some(file_name) = file.file_name() {
                    dataset.filenames.push(split.join(&name).join(file_name));
                    dataset.labels.push(name.clone());
                }
            }
        }
        if dataset.filenames.is_empty() {
            return Err(BowErr::NoImages(root.join(split)));
        }
        debug!(
            "Read {} images from {:?}",
            dataset.filenames.len(),
            root.join(split)
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.filenames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filenames.is_empty()
    }
}

/// Sorted sub-directories of `dir`.
pub fn class_dirs(dir: &Path) -> BowResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in dir.read_dir()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Sorted image files directly under `dir`.
pub fn image_files(dir: &Path) -> BowResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in dir.read_dir()? {
        let path = entry?.path();
        if path.is_file() && is_image(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn read_split_lists_classes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (class, files) in [("street", vec!["b.jpg", "a.png"]), ("coast", vec!["c.jpg"])] {
            let class_dir = dir.path().join("train").join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for f in files {
                fs::write(class_dir.join(f), b"").unwrap();
            }
            fs::write(class_dir.join("notes.txt"), b"").unwrap();
        }

        let root = DataRoot::new(dir.path());
        let ds = Dataset::read_split(&root, "train").unwrap();
        assert_eq!(ds.labels, vec!["coast", "street", "street"]);
        assert_eq!(ds.filenames[1], PathBuf::from("train/street/a.png"));
        assert_eq!(ds.len(), 3);
    }

    #[test]
    fn empty_split_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("test")).unwrap();
        let root = DataRoot::new(dir.path());
        assert!(matches!(
            Dataset::read_split(&root, "test"),
            Err(BowErr::NoImages(_))
        ));
    }
}
