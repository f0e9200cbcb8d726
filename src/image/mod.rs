//! Image generation requests and the remote client.

mod backend;
pub mod flux;
mod types;

pub use backend::GenerationBackend;
pub use flux::{FluxClient, FluxClientBuilder, FluxEngine};
pub use types::{
    Artifact, AspectRatio, GenerationRequest, ImageFormat, JobHandle, JobStatus,
};
