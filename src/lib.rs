#![warn(missing_docs)]
//! FluxView - prompt-to-image generation against the Black Forest Labs Flux API.
//!
//! The crate is split into a thin HTTP client ([`FluxClient`]), a job
//! pipeline that drives one generation at a time through submit, poll and
//! download ([`JobPipeline`]), and local stores for the API key, the last
//! prompt and saved images.
//!
//! # Quick Start
//!
//! ```no_run
//! use fluxview::{CredentialStore, FluxClient, GenerationRequest};
//!
//! #[tokio::main]
//! async fn main() -> fluxview::Result<()> {
//!     let credential = CredentialStore::new("api_key.txt")
//!         .resolve()?
//!         .expect("BFL_API_KEY not set");
//!     let client = FluxClient::builder().credential(credential).build()?;
//!
//!     let job = client.create_job(&GenerationRequest::new("A red fox in snow")).await?;
//!     println!("submitted {}", job.id);
//!     Ok(())
//! }
//! ```
//!
//! See [`pipeline`] for polling and event delivery.
//!
//! # Features
//!
//! - `cli`: the `fluxview` command-line front end (enabled by default)

pub mod config;
mod error;
pub mod image;
pub mod pipeline;
pub mod store;

// Re-export error types at crate root
pub use error::{ErrorKind, FluxViewError, Result};

pub use config::Settings;
pub use image::{
    Artifact, AspectRatio, FluxClient, FluxClientBuilder, FluxEngine, GenerationBackend,
    GenerationRequest, ImageFormat, JobHandle, JobStatus,
};
pub use pipeline::{
    JobPipeline, JobPipelineBuilder, PipelineConfig, PipelineEvent, PipelineState, RunId,
};
pub use store::{ArtifactStore, Credential, CredentialStore, PromptHistory};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{FluxViewError, Result};
    pub use crate::image::{FluxClient, GenerationBackend, GenerationRequest};
    pub use crate::pipeline::{JobPipeline, PipelineEvent, PipelineState};
}
