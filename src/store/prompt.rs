//! Last-prompt convenience file.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Remembers the most recently submitted prompt in a text file.
#[derive(Debug, Clone)]
pub struct PromptHistory {
    path: PathBuf,
}

impl PromptHistory {
    /// Creates a history backed by the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last stored prompt, if any.
    pub fn last(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(None),
            Ok(s) => Ok(Some(s.trim_end_matches(['\r', '\n']).to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores a prompt. Blank prompts leave the file untouched.
    pub fn remember(&self, prompt: &str) -> Result<()> {
        if prompt.trim().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, prompt)?;
        Ok(())
    }
}
