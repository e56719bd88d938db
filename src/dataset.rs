//! Loading labeled bird images from a `classes.txt` + `images/<class>/` tree.

use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::path::{Path, PathBuf};

/// The question paired with every training image.
pub const BIRD_QUESTION: &str = "Which bird is in the image?";

/// Name of the class manifest inside the dataset base directory.
pub const MANIFEST_FILE: &str = "classes.txt";

/// Name of the folder holding one sub-folder of images per class.
pub const IMAGES_DIR: &str = "images";

/// Largest class id accepted from the manifest.
pub const MAX_CLASS_ID: u32 = 100_000;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to list {path}: {source}")]
    Folder {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One `<id> <class_name>` line of the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 1-based id as written in the manifest.
    pub id: u32,
    pub name: String,
}

impl ManifestEntry {
    /// 0-based label used by the model.
    pub fn label(&self) -> u32 {
        self.id.saturating_sub(1)
    }
}

/// A single (image, question, label) triple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub image_path: PathBuf,
    pub question: String,
    pub label: u32,
}

/// Three parallel sequences of equal length.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BirdSamples {
    pub image_paths: Vec<PathBuf>,
    pub questions: Vec<String>,
    pub labels: Vec<u32>,
}

impl BirdSamples {
    pub fn len(&self) -> usize {
        self.image_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_paths.is_empty()
    }

    pub fn push(&mut self, sample: Sample) {
        self.image_paths.push(sample.image_path);
        self.questions.push(sample.question);
        self.labels.push(sample.label);
    }

    pub fn get(&self, index: usize) -> Option<Sample> {
        Some(Sample {
            image_path: self.image_paths.get(index)?.clone(),
            question: self.questions.get(index)?.clone(),
            label: *self.labels.get(index)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Sample> + '_ {
        (0..self.len()).filter_map(|i| self.get(i))
    }

    /// Splits positionally: the first `ratio` share goes to the first half.
    pub fn split(&self, ratio: f64) -> (BirdSamples, BirdSamples) {
        let at = ((self.len() as f64) * ratio) as usize;
        let at = at.min(self.len());
        let head = BirdSamples {
            image_paths: self.image_paths[..at].to_vec(),
            questions: self.questions[..at].to_vec(),
            labels: self.labels[..at].to_vec(),
        };
        let tail = BirdSamples {
            image_paths: self.image_paths[at..].to_vec(),
            questions: self.questions[at..].to_vec(),
            labels: self.labels[at..].to_vec(),
        };
        (head, tail)
    }

    /// Returns a copy with the samples permuted by a seeded RNG.
    pub fn shuffled(&self, seed: u64) -> BirdSamples {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let mut out = BirdSamples::default();
        for i in order {
            if let Some(sample) = self.get(i) {
                out.push(sample);
            }
        }
        out
    }
}

/// The manifest classes together with the samples found for them.
#[derive(Clone, Debug, Default)]
pub struct LoadedDataset {
    pub classes: Vec<ManifestEntry>,
    pub samples: BirdSamples,
}

impl LoadedDataset {
    /// Number of output classes implied by the manifest (highest id).
    /// Ids outside `1..=MAX_CLASS_ID` are ignored.
    pub fn num_labels(&self) -> usize {
        self.valid_classes()
            .map(|c| c.id as usize)
            .max()
            .unwrap_or(0)
    }

    fn valid_classes(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.classes
            .iter()
            .filter(|c| (1..=MAX_CLASS_ID).contains(&c.id))
    }

    /// Class names indexed by label. Ids never mentioned get a placeholder.
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..self.num_labels())
            .map(|i| format!("LABEL_{i}"))
            .collect();
        for class in self.valid_classes() {
            names[class.label() as usize] = class.name.clone();
        }
        names
    }
}

/// Parses manifest text. Lines without a separating space or with an
/// id outside `1..=`[`MAX_CLASS_ID`] are skipped.
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let Some((id, name)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        match id.parse::<u32>() {
            Ok(id) if (1..=MAX_CLASS_ID).contains(&id) => entries.push(ManifestEntry {
                id,
                name: name.to_string(),
            }),
            _ => log::warn!("Skipping manifest line with invalid id: '{}'", line.trim()),
        }
    }
    entries
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Lists the image files of one class folder in directory-listing order.
pub fn class_images(folder: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let read_dir = std::fs::read_dir(folder).map_err(|source| DatasetError::Folder {
        path: folder.to_path_buf(),
        source,
    })?;

    let mut images = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| DatasetError::Folder {
            path: folder.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    Ok(images)
}

/// Reads the manifest under `base` and collects one sample per image.
///
/// Missing class folders are skipped with a warning. Sample order follows
/// the directory listing and is not stable across platforms.
pub fn try_load_dataset(base: impl AsRef<Path>) -> Result<LoadedDataset, DatasetError> {
    let base = base.as_ref();
    let manifest_path = base.join(MANIFEST_FILE);
    let text = std::fs::read_to_string(&manifest_path).map_err(|source| {
        DatasetError::Manifest {
            path: manifest_path.clone(),
            source,
        }
    })?;

    let classes = parse_manifest(&text);
    let images_dir = base.join(IMAGES_DIR);
    let mut samples = BirdSamples::default();

    for class in &classes {
        let folder = images_dir.join(&class.name);
        if !folder.is_dir() {
            log::warn!("Folder '{}' not found", folder.display());
            continue;
        }
        for image_path in class_images(&folder)? {
            samples.push(Sample {
                image_path,
                question: BIRD_QUESTION.to_string(),
                label: class.label(),
            });
        }
    }

    log::debug!(
        "Loaded {} samples across {} classes from {}",
        samples.len(),
        classes.len(),
        base.display()
    );

    Ok(LoadedDataset { classes, samples })
}

/// Like [`try_load_dataset`], but an unreadable manifest yields an empty
/// dataset after logging the problem. Callers treat empty as "no data".
pub fn load_dataset(base: impl AsRef<Path>) -> LoadedDataset {
    match try_load_dataset(base) {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("{e}. Please check the file path.");
            LoadedDataset::default()
        }
    }
}
