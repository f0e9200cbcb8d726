//! The background task that drives one run through create, poll and fetch.

use crate::error::{FluxViewError, Result};
use crate::image::{Artifact, GenerationBackend, GenerationRequest, JobHandle, JobStatus};
use crate::pipeline::state::{PipelineEvent, PipelineState, RunId};
use crate::pipeline::PipelineConfig;
use crate::store::ArtifactStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// A run plus its stale flag. Once the flag is set it is never cleared.
#[derive(Debug, Clone)]
pub(crate) struct ActiveRun {
    pub(crate) id: RunId,
    stale: Arc<AtomicBool>,
}

impl ActiveRun {
    pub(crate) fn new(id: RunId) -> Self {
        Self {
            id,
            stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

/// Mutable pipeline state, guarded by [`Shared::slot`].
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) active: Option<ActiveRun>,
    pub(crate) state: PipelineState,
    pub(crate) artifact: Option<Arc<Artifact>>,
}

impl Slot {
    fn is_current(&self, run: &ActiveRun) -> bool {
        !run.is_stale() && self.active.as_ref().is_some_and(|a| a.id == run.id)
    }
}

/// State shared between the pipeline handle and its run tasks.
pub(crate) struct Shared {
    pub(crate) backend: Arc<dyn GenerationBackend>,
    pub(crate) store: ArtifactStore,
    pub(crate) config: PipelineConfig,
    events: mpsc::UnboundedSender<PipelineEvent>,
    slot: Mutex<Slot>,
}

/// Outcome of a step that may find its run superseded.
enum Step<T> {
    Continue(T),
    Stale,
}

impl Shared {
    pub(crate) fn new(
        backend: Arc<dyn GenerationBackend>,
        store: ArtifactStore,
        config: PipelineConfig,
        events: mpsc::UnboundedSender<PipelineEvent>,
    ) -> Self {
        Self {
            backend,
            store,
            config,
            events,
            slot: Mutex::new(Slot {
                active: None,
                state: PipelineState::Idle,
                artifact: None,
            }),
        }
    }

    /// Locks the slot. Events are only ever sent while this guard is held.
    pub(crate) fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("pipeline event receiver dropped");
        }
    }

    pub(crate) fn set_state(&self, slot: &mut Slot, run: RunId, state: PipelineState) {
        tracing::debug!(%run, state = state.label(), "pipeline state changed");
        slot.state = state.clone();
        self.emit(PipelineEvent::StateChanged { run, state });
    }

    /// Moves a still-current run to `state`.
    fn advance(&self, run: &ActiveRun, state: PipelineState) -> Step<()> {
        let mut slot = self.slot();
        if !slot.is_current(run) {
            tracing::debug!(run = %run.id, state = state.label(), "dropping transition of stale run");
            return Step::Stale;
        }
        self.set_state(&mut slot, run.id, state);
        Step::Continue(())
    }

    /// Runs create, poll and fetch for one submission.
    pub(crate) async fn drive(self: Arc<Self>, run: ActiveRun, request: Arc<GenerationRequest>) {
        if let Err(e) = self.execute(&run, &request).await {
            self.fail(&run, &e);
        }
    }

    async fn execute(&self, run: &ActiveRun, request: &GenerationRequest) -> Result<()> {
        let handle = self.backend.create_job(request).await?;
        tracing::debug!(run = %run.id, job_id = %handle.id, "job accepted");

        let polling = PipelineState::Polling {
            job_id: handle.id.clone(),
        };
        if let Step::Stale = self.advance(run, polling) {
            return Ok(());
        }

        let sample_url = match self.poll_until_ready(run, &handle).await? {
            Step::Continue(url) => url,
            Step::Stale => return Ok(()),
        };

        let fetching = PipelineState::Fetching {
            job_id: handle.id.clone(),
        };
        if let Step::Stale = self.advance(run, fetching) {
            return Ok(());
        }

        let bytes = self.backend.fetch_image(&sample_url).await?;
        self.complete(run, Artifact::new(bytes, sample_url)).await;
        Ok(())
    }

    async fn poll_until_ready(&self, run: &ActiveRun, handle: &JobHandle) -> Result<Step<String>> {
        let interval = self.config.poll_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts: u32 = 0;

        loop {
            ticker.tick().await;

            if run.is_stale() {
                tracing::debug!(run = %run.id, job_id = %handle.id, "run superseded, polling stopped");
                return Ok(Step::Stale);
            }
            if let Some(max) = self.config.max_poll_attempts {
                if attempts >= max {
                    return Err(FluxViewError::Timeout(interval * max));
                }
            }
            attempts += 1;

            match self.backend.poll_job(&handle.id).await? {
                JobStatus::Pending => {
                    tracing::debug!(
                        run = %run.id,
                        job_id = %handle.id,
                        attempts,
                        elapsed_secs = (chrono::Utc::now() - handle.submitted_at).num_seconds(),
                        "job pending"
                    );
                }
                JobStatus::Ready { sample_url } => {
                    tracing::debug!(run = %run.id, url = %sample_url, "generation complete");
                    return Ok(Step::Continue(sample_url));
                }
                JobStatus::Failed { reason } => return Err(FluxViewError::Remote(reason)),
            }
        }
    }

    /// Saves (if configured) and publishes a finished artifact.
    async fn complete(&self, run: &ActiveRun, artifact: Artifact) {
        if run.is_stale() {
            tracing::debug!(run = %run.id, "discarding image of stale run");
            return;
        }

        // Written outside the lock; a run superseded during the write keeps
        // its file but is never published.
        let (artifact, save_error) = if self.config.auto_save {
            let store = self.store.clone();
            let written = tokio::task::spawn_blocking(move || {
                let result = store.save(&artifact, None);
                (artifact, result)
            })
            .await;

            match written {
                Ok((artifact, Ok(path))) => (
                    Artifact {
                        saved_path: Some(path),
                        ..artifact
                    },
                    None,
                ),
                Ok((artifact, Err(e))) => {
                    tracing::warn!(run = %run.id, error = %e, "auto-save failed");
                    (artifact, Some(e))
                }
                Err(e) => {
                    self.fail(run, &FluxViewError::Io(std::io::Error::other(e)));
                    return;
                }
            }
        } else {
            (artifact, None)
        };

        let mut slot = self.slot();
        if !slot.is_current(run) {
            tracing::debug!(run = %run.id, "discarding image of stale run");
            return;
        }

        if let Some(e) = save_error {
            self.emit(PipelineEvent::Error {
                run: run.id,
                kind: e.kind(),
                message: e.to_string(),
                status: e.status(),
            });
        }

        let artifact = Arc::new(artifact);
        slot.artifact = Some(Arc::clone(&artifact));
        let ready = PipelineState::Ready {
            saved_path: artifact.saved_path.clone(),
        };
        self.set_state(&mut slot, run.id, ready);
        self.emit(PipelineEvent::ImageReady {
            run: run.id,
            artifact,
        });
    }

    /// Moves a still-current run to `Failed` and reports the error once.
    fn fail(&self, run: &ActiveRun, error: &FluxViewError) {
        let mut slot = self.slot();
        if !slot.is_current(run) {
            tracing::debug!(run = %run.id, error = %error, "dropping failure of stale run");
            return;
        }

        tracing::warn!(run = %run.id, error = %error, "generation run failed");
        let kind = error.kind();
        let message = error.to_string();
        let status = error.status();
        self.set_state(
            &mut slot,
            run.id,
            PipelineState::Failed {
                kind,
                message: message.clone(),
                status,
            },
        );
        self.emit(PipelineEvent::Error {
            run: run.id,
            kind,
            message,
            status,
        });
    }
}
