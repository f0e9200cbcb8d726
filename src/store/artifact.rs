//! Writing generated images to disk.

use crate::error::Result;
use crate::image::{Artifact, ImageFormat};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};

/// Directory, relative to the store root, holding dated output folders.
pub const OUTPUTS_DIR: &str = "outputs";

/// Persists artifacts under `<root>/outputs/<YYYY-MM-DD>/image_<HH-MM-SS>.png`
/// or at an explicit path.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Computes the dated output path for a given moment.
    pub fn dated_path(&self, at: DateTime<Local>) -> PathBuf {
        self.root
            .join(OUTPUTS_DIR)
            .join(at.format("%Y-%m-%d").to_string())
            .join(format!("image_{}.png", at.format("%H-%M-%S")))
    }

    /// Writes the artifact bytes and returns the path written.
    ///
    /// Without an explicit path the dated layout is used. Parent directories
    /// are created as needed; an existing file at the target is replaced.
    pub fn save(&self, artifact: &Artifact, explicit_path: Option<&Path>) -> Result<PathBuf> {
        let path = match explicit_path {
            Some(p) => p.to_path_buf(),
            None => self.dated_path(Local::now()),
        };

        if artifact.detected_format() != Some(ImageFormat::Png) {
            tracing::warn!(
                path = %path.display(),
                source = %artifact.source_url,
                "artifact bytes are not PNG, saving as-is"
            );
        }

        write_creating_parents(&path, &artifact.bytes)?;
        tracing::info!(path = %path.display(), bytes = artifact.size(), "saved image");

        Ok(path)
    }
}

fn write_creating_parents(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        // create_dir_all succeeds when the directory already exists
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)
}
