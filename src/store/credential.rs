//! API key persistence.

use crate::error::{FluxViewError, Result};
use std::path::{Path, PathBuf};

/// Environment variable consulted when no key file is present.
pub const API_KEY_ENV: &str = "BFL_API_KEY";

/// An API key for the generation service.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    api_key: String,
}

impl Credential {
    /// Wraps a key, trimming surrounding whitespace.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(FluxViewError::InvalidCredential(
                "API key must not be empty".into(),
            ));
        }
        Ok(Self { api_key })
    }

    /// Returns the key sent in the `x-key` header.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Reads and writes the API key as a bare string in a local file.
///
/// The store never prompts; callers ask the user when [`load`](Self::load)
/// returns `None` and hand the answer to [`provision`](Self::provision).
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Creates a store backed by the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored key. A missing or blank file yields `None`.
    pub fn load(&self) -> Result<Option<Credential>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Credential::new(contents).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists a non-empty key and returns it as a credential.
    pub fn provision(&self, value: &str) -> Result<Credential> {
        let credential = Credential::new(value)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, credential.api_key())?;
        tracing::debug!(path = %self.path.display(), "stored API key");

        Ok(credential)
    }

    /// Loads the stored key, falling back to the `BFL_API_KEY` variable.
    pub fn resolve(&self) -> Result<Option<Credential>> {
        self.resolve_with(|var| std::env::var(var).ok())
    }

    fn resolve_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Credential>> {
        if let Some(credential) = self.load()? {
            return Ok(Some(credential));
        }
        Ok(lookup(API_KEY_ENV).and_then(|key| Credential::new(key).ok()))
    }
}
