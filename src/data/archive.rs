use anyhow::{Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::SentimentError;

/// Archive expected in the training data directory
pub const TRAIN_VAL_ARCHIVE: &str = "train_val.zip";
pub const TRAIN_FILE: &str = "train_text.csv.gz";
pub const VAL_FILE: &str = "val_text.csv.gz";

/// Extract every entry of `zip_path` into `dest_dir`
pub fn extract_zip<P: AsRef<Path>, Q: AsRef<Path>>(zip_path: P, dest_dir: Q) -> Result<()> {
    let zip_path = zip_path.as_ref();
    let dest_dir = dest_dir.as_ref();
    let file = File::open(zip_path)
        .with_context(|| format!("Failed to open archive {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive {}", zip_path.display()))?;
    log::info!("Extracting {} entries from {}", archive.len(), zip_path.display());
    archive
        .extract(dest_dir)
        .with_context(|| format!("Failed to extract {} into {}", zip_path.display(), dest_dir.display()))?;
    Ok(())
}

/// Paths of the train and validation files inside `dir`
#[derive(Debug, Clone)]
pub struct SplitFiles {
    pub train: PathBuf,
    pub val: PathBuf,
}

impl SplitFiles {
    pub fn locate<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let train = dir.join(TRAIN_FILE);
        let val = dir.join(VAL_FILE);
        for path in [&train, &val] {
            if !path.is_file() {
                return Err(SentimentError::Data(format!("expected {} to exist", path.display())).into());
            }
        }
        Ok(Self { train, val })
    }
}
