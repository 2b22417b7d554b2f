//! The example archive directory (egs) consumed by training.
//!
//! Layout: `<egs>/info/{feat_dim,ivector_dim,left_context,right_context,
//! frames_per_eg,num_archives}` each hold one integer; archives are
//! `<egs>/*.ark`, possibly symlinks into scratch storage.

use std::path::{Path, PathBuf};

/// Properties the archives were generated with, read from `<egs>/info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePool {
    pub dir: PathBuf,
    pub feat_dim: i64,
    pub ivector_dim: i64,
    pub left_context: i64,
    pub right_context: i64,
    pub frames_per_eg: i64,
    pub num_archives: usize,
}

/// What the experiment requires of the archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub feat_dim: i64,
    pub ivector_dim: i64,
    pub left_context: i64,
    pub right_context: i64,
    pub chunk_width: i64,
}

/// Files copied next to the model for use at decoding time.
const PROPERTY_FILES: &[&str] = &["cmvn_opts", "splice_opts", "info/final.ie.id", "final.mat"];

/// Marker that protects an egs directory from removal.
const NODELETE_MARKER: &str = ".nodelete";

impl ArchivePool {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, GeometryError> {
        let dir = dir.as_ref().to_path_buf();
        let info = dir.join("info");
        let num_archives = read_info(&info, "num_archives")?;
        let num_archives = usize::try_from(num_archives)
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| GeometryError::NoArchives(dir.clone()))?;

        Ok(Self {
            feat_dim: read_info(&info, "feat_dim")?,
            ivector_dim: read_info(&info, "ivector_dim")?,
            left_context: read_info(&info, "left_context")?,
            right_context: read_info(&info, "right_context")?,
            frames_per_eg: read_info(&info, "frames_per_eg")?,
            num_archives,
            dir,
        })
    }

    /// Check that the archives can serve an experiment with `required`
    /// geometry.
    pub fn verify(&self, required: &Geometry) -> Result<(), GeometryError> {
        if self.feat_dim != required.feat_dim {
            return Err(GeometryError::Mismatch {
                what: "feature dimension",
                expected: required.feat_dim,
                found: self.feat_dim,
            });
        }
        if self.ivector_dim != required.ivector_dim {
            return Err(GeometryError::Mismatch {
                what: "ivector dimension",
                expected: required.ivector_dim,
                found: self.ivector_dim,
            });
        }
        if self.left_context < required.left_context {
            return Err(GeometryError::InsufficientContext {
                side: "left",
                required: required.left_context,
                found: self.left_context,
            });
        }
        if self.right_context < required.right_context {
            return Err(GeometryError::InsufficientContext {
                side: "right",
                required: required.right_context,
                found: self.right_context,
            });
        }
        if self.frames_per_eg != required.chunk_width {
            return Err(GeometryError::Mismatch {
                what: "frames per example",
                expected: required.chunk_width,
                found: self.frames_per_eg,
            });
        }
        Ok(())
    }

    /// Copy the feature-pipeline properties of the egs into `dest`.
    pub fn copy_properties_to(&self, dest: &Path) -> Result<usize, GeometryError> {
        let mut copied = 0;
        for name in PROPERTY_FILES {
            let src = self.dir.join(name);
            if !src.is_file() {
                continue;
            }
            let Some(file_name) = src.file_name() else {
                continue;
            };
            let target = dest.join(file_name);
            std::fs::copy(&src, &target).map_err(|e| GeometryError::Copy(src.clone(), e))?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Delete the archives, following symlinks to their storage.
    ///
    /// Best effort: failures are logged, and a `.nodelete` marker leaves the
    /// directory untouched. Returns the number of archives removed.
    pub fn remove(&self) -> usize {
        if self.dir.join(NODELETE_MARKER).exists() {
            tracing::info!(
                "Not removing egs in {}: {NODELETE_MARKER} present",
                self.dir.display()
            );
            return 0;
        }
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Failed to list egs in {}: {e}", self.dir.display());
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "ark") {
                continue;
            }
            if let Ok(target) = std::fs::read_link(&path) {
                let target = if target.is_relative() {
                    self.dir.join(target)
                } else {
                    target
                };
                if let Err(e) = std::fs::remove_file(&target) {
                    tracing::warn!("Failed to remove {}: {e}", target.display());
                }
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {e}", path.display()),
            }
        }
        tracing::info!("Removed {removed} archives from {}", self.dir.display());
        removed
    }
}

fn read_info(info: &Path, name: &str) -> Result<i64, GeometryError> {
    let path = info.join(name);
    let content =
        std::fs::read_to_string(&path).map_err(|e| GeometryError::Read(path.clone(), e))?;
    content
        .trim()
        .parse()
        .map_err(|_| GeometryError::Parse(path, content.trim().to_string()))
}

/// Errors from inspecting the archive directory.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("{0} does not hold an integer: '{1}'")]
    Parse(PathBuf, String),
    #[error("no archives in {0}")]
    NoArchives(PathBuf),
    #[error("{what} mismatch: expected {expected}, egs have {found}")]
    Mismatch {
        what: &'static str,
        expected: i64,
        found: i64,
    },
    #[error("egs {side} context {found} is less than the required {required}")]
    InsufficientContext {
        side: &'static str,
        required: i64,
        found: i64,
    },
    #[error("failed to copy {0}: {1}")]
    Copy(PathBuf, std::io::Error),
}
