//! Local persistence: images, API key and last prompt.

pub mod artifact;
pub mod credential;
pub mod prompt;

pub use artifact::ArtifactStore;
pub use credential::{Credential, CredentialStore};
pub use prompt::PromptHistory;
