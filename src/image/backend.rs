//! Remote backend trait used by the job pipeline.

use crate::error::Result;
use crate::image::types::{GenerationRequest, JobHandle, JobStatus};
use async_trait::async_trait;
use std::sync::Arc;

/// The three remote calls a generation run is made of.
///
/// Implementations are stateless per call; the pipeline owns all run state.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submits a job and returns its handle.
    async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle>;

    /// Reports the current status of a job.
    async fn poll_job(&self, id: &str) -> Result<JobStatus>;

    /// Downloads the finished image from its sample URL.
    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>>;

    /// Returns the name of this backend for display.
    fn name(&self) -> &str {
        "generation backend"
    }
}

#[async_trait]
impl<T: GenerationBackend + ?Sized> GenerationBackend for Arc<T> {
    async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle> {
        (**self).create_job(request).await
    }

    async fn poll_job(&self, id: &str) -> Result<JobStatus> {
        (**self).poll_job(id).await
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        (**self).fetch_image(url).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
