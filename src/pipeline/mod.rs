//! Generation job pipeline.
//!
//! A [`JobPipeline`] owns at most one active run. [`JobPipeline::submit`]
//! validates the request, supersedes whatever run was in flight and spawns a
//! task that creates the remote job, polls it on a fixed interval and
//! downloads the finished image. Progress is published as
//! [`PipelineEvent`]s on the channel returned by [`JobPipelineBuilder::build`].
//!
//! Superseded runs are never interrupted. Their stale flag is set and every
//! later transition they attempt is dropped, so once `submit` returns no
//! event of an older run can reach the receiver.
//!
//! ```no_run
//! use fluxview::pipeline::{JobPipeline, PipelineEvent};
//! use fluxview::{Credential, FluxClient, GenerationRequest};
//!
//! #[tokio::main]
//! async fn main() -> fluxview::Result<()> {
//!     let client = FluxClient::builder()
//!         .credential(Credential::new("bfl-key")?)
//!         .build()?;
//!     let (pipeline, mut events) = JobPipeline::builder(client).build()?;
//!
//!     let run = pipeline.submit(GenerationRequest::new("A lighthouse at dusk"))?;
//!     while let Some(event) = events.recv().await {
//!         if let PipelineEvent::ImageReady { run: r, artifact } = event {
//!             assert_eq!(r, run);
//!             println!("{} bytes", artifact.size());
//!             break;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod run;
mod state;

pub use state::{PipelineEvent, PipelineState, RunId};

use crate::error::{FluxViewError, Result};
use crate::image::{Artifact, AspectRatio, GenerationBackend, GenerationRequest};
use crate::store::ArtifactStore;
use run::{ActiveRun, Shared};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Delay between status polls unless configured otherwise.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Behaviour switches that used to be separate app variants.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Give up with a timeout after this many polls. `None` polls forever.
    pub max_poll_attempts: Option<u32>,
    /// Save each finished image to the dated outputs tree.
    pub auto_save: bool,
    /// Accept requests with `raw` set.
    pub raw_mode: bool,
    /// Aspect ratios offered to the user.
    pub aspect_ratios: Vec<AspectRatio>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: None,
            auto_save: true,
            raw_mode: true,
            aspect_ratios: AspectRatio::ALL.to_vec(),
        }
    }
}

impl PipelineConfig {
    /// Checks a request against the request rules and this configuration.
    pub fn check(&self, request: &GenerationRequest) -> Result<()> {
        request.validate()?;

        if let Some(ratio) = request.aspect_ratio {
            if !self.aspect_ratios.contains(&ratio) {
                return Err(FluxViewError::InvalidRequest(format!(
                    "aspect ratio {ratio} is not enabled"
                )));
            }
        }
        if request.raw && !self.raw_mode {
            return Err(FluxViewError::InvalidRequest(
                "raw mode is not enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`JobPipeline`].
pub struct JobPipelineBuilder {
    backend: Arc<dyn GenerationBackend>,
    config: PipelineConfig,
    store: ArtifactStore,
    runtime: Option<Handle>,
}

impl JobPipelineBuilder {
    /// Sets the pipeline configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets where images are saved. Defaults to the current directory.
    pub fn artifact_store(mut self, store: ArtifactStore) -> Self {
        self.store = store;
        self
    }

    /// Sets the runtime run tasks are spawned on.
    ///
    /// Needed when the pipeline is built outside a tokio context, e.g. on a
    /// UI thread.
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Builds the pipeline and the receiving end of its event channel.
    pub fn build(self) -> Result<(JobPipeline, mpsc::UnboundedReceiver<PipelineEvent>)> {
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| {
                FluxViewError::Config("no tokio runtime available for the job pipeline".into())
            })?,
        };
        if self.config.poll_interval.is_zero() {
            return Err(FluxViewError::Config(
                "poll interval must be greater than zero".into(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared::new(self.backend, self.store, self.config, tx);

        Ok((
            JobPipeline {
                shared: Arc::new(shared),
                runtime,
                next_run: AtomicU64::new(1),
            },
            rx,
        ))
    }
}

/// Drives generation runs and keeps the latest artifact.
pub struct JobPipeline {
    shared: Arc<Shared>,
    runtime: Handle,
    next_run: AtomicU64,
}

impl JobPipeline {
    /// Creates a new [`JobPipelineBuilder`] around a backend.
    pub fn builder(backend: impl GenerationBackend + 'static) -> JobPipelineBuilder {
        JobPipelineBuilder {
            backend: Arc::new(backend),
            config: PipelineConfig::default(),
            store: ArtifactStore::new("."),
            runtime: None,
        }
    }

    /// Starts a new run, superseding any run still in flight.
    ///
    /// Invalid requests are rejected here without touching the network or
    /// the current run.
    pub fn submit(&self, request: GenerationRequest) -> Result<RunId> {
        self.shared.config.check(&request)?;

        let run = {
            let mut slot = self.shared.slot();
            let run = ActiveRun::new(RunId(self.next_run.fetch_add(1, Ordering::Relaxed)));
            if let Some(previous) = slot.active.replace(run.clone()) {
                previous.mark_stale();
                tracing::debug!(previous = %previous.id, run = %run.id, "superseding run");
            }
            self.shared
                .set_state(&mut slot, run.id, PipelineState::Submitting);
            run
        };

        let id = run.id;
        tracing::info!(
            %id,
            backend = self.shared.backend.name(),
            prompt_len = request.prompt.len(),
            "submitting generation request"
        );
        self.runtime
            .spawn(Arc::clone(&self.shared).drive(run, Arc::new(request)));

        Ok(id)
    }

    /// Abandons the current run. Late results from it are dropped.
    ///
    /// Returns the cancelled run, if there was one.
    pub fn cancel(&self) -> Option<RunId> {
        let mut slot = self.shared.slot();
        let run = slot.active.take()?;
        run.mark_stale();
        tracing::debug!(run = %run.id, "run cancelled");
        self.shared.set_state(&mut slot, run.id, PipelineState::Idle);
        Some(run.id)
    }

    /// Returns the current state.
    pub fn state(&self) -> PipelineState {
        self.shared.slot().state.clone()
    }

    /// Returns the run whose results are currently accepted.
    pub fn current_run(&self) -> Option<RunId> {
        self.shared.slot().active.as_ref().map(|run| run.id)
    }

    /// Returns the most recent image, if any run has produced one.
    pub fn artifact(&self) -> Option<Arc<Artifact>> {
        self.shared.slot().artifact.clone()
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Saves the most recent image, to `explicit_path` or the dated layout.
    ///
    /// Pipeline state is left untouched whether or not the write succeeds.
    pub fn save(&self, explicit_path: Option<&Path>) -> Result<PathBuf> {
        let artifact = self.require_artifact()?;
        self.shared.store.save(&artifact, explicit_path)
    }

    /// Scales the most recent image to fit a display area.
    pub fn preview(&self, max_width: u32, max_height: u32) -> Result<::image::RgbaImage> {
        self.require_artifact()?.preview(max_width, max_height)
    }

    /// Downloads the most recent image again from its sample URL.
    ///
    /// A read-only operation: state, events and the stored artifact are not
    /// affected. Sample URLs expire, so this can fail with a fetch error
    /// long after the run finished.
    pub async fn refetch(&self) -> Result<Vec<u8>> {
        let artifact = self.require_artifact()?;
        self.shared.backend.fetch_image(&artifact.source_url).await
    }

    fn require_artifact(&self) -> Result<Arc<Artifact>> {
        self.artifact()
            .ok_or_else(|| FluxViewError::InvalidRequest("no image available yet".into()))
    }
}

impl Drop for JobPipeline {
    fn drop(&mut self) {
        if let Some(run) = self.shared.slot().active.take() {
            run.mark_stale();
        }
    }
}

#[cfg(test)]
mod tests;
