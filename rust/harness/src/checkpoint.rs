//! Checkpoint naming, retention and cleanup.
//!
//! Checkpoint `i` is the model iteration `i` starts from; iteration `i`
//! writes checkpoint `i + 1`. The combined model is `final.raw`.

use std::path::{Path, PathBuf};

use crate::plan::CombinationSet;

/// Owns the numbered checkpoints of one experiment directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    combination: CombinationSet,
    preserve_model_interval: usize,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(
        dir: impl AsRef<Path>,
        combination: CombinationSet,
        preserve_model_interval: usize,
    ) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            combination,
            preserve_model_interval,
        }
    }

    #[must_use]
    pub fn path(&self, index: usize) -> PathBuf {
        checkpoint_path(&self.dir, index)
    }

    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        self.dir.join("final.raw")
    }

    #[must_use]
    pub fn exists(&self, index: usize) -> bool {
        self.path(index).is_file()
    }

    /// Whether `index` survives cleanup by the preservation interval.
    #[must_use]
    pub fn is_preserved(&self, index: usize) -> bool {
        self.preserve_model_interval > 0 && index % self.preserve_model_interval == 0
    }

    /// Whether a superseded checkpoint must be kept during training.
    #[must_use]
    pub fn is_retained(&self, index: usize) -> bool {
        self.is_preserved(index) || self.combination.contains(index)
    }

    /// Delete checkpoint `index` unless it is retained.
    ///
    /// Negative indices and already-absent files are not errors. Returns
    /// whether a file was removed.
    pub fn retire(&self, index: i64) -> Result<bool, CheckpointError> {
        let Ok(index) = usize::try_from(index) else {
            return Ok(false);
        };
        if self.is_retained(index) {
            return Ok(false);
        }
        remove_if_present(&self.path(index))
    }

    /// Remove every intermediate checkpoint below `num_iters` not kept by
    /// the preservation interval. The combination set is not consulted: once
    /// `final.raw` exists the candidates are no longer needed.
    pub fn clean(&self, num_iters: usize) -> Result<usize, CheckpointError> {
        let mut removed = 0;
        for index in 0..num_iters {
            if self.is_preserved(index) {
                continue;
            }
            if remove_if_present(&self.path(index))? {
                removed += 1;
            }
        }
        tracing::info!(
            "Removed {removed} intermediate checkpoints from {}",
            self.dir.display()
        );
        Ok(removed)
    }
}

/// Path of checkpoint `index` inside `dir`.
#[must_use]
pub fn checkpoint_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("{index}.raw"))
}

fn remove_if_present(path: &Path) -> Result<bool, CheckpointError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!("Removed checkpoint {}", path.display());
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CheckpointError::Remove(path.to_path_buf(), e)),
    }
}

/// Errors that can occur when managing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("failed to remove checkpoint {0}: {1}")]
    Remove(PathBuf, std::io::Error),
}
