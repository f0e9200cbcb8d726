//! Pipeline states and the events published to the presentation surface.

use crate::error::ErrorKind;
use crate::image::Artifact;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Identifies one submission within a pipeline.
///
/// Ids increase monotonically, so a larger id always belongs to a newer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RunId(pub(crate) u64);

impl RunId {
    /// Returns the raw run number.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Where the current run is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    /// Nothing submitted, or the last run was cancelled.
    Idle,
    /// Create-job call in flight.
    Submitting,
    /// Job accepted; waiting for a terminal status.
    Polling { job_id: String },
    /// Job finished; downloading the image.
    Fetching { job_id: String },
    /// Image available. `saved_path` is set when auto-save succeeded.
    Ready { saved_path: Option<PathBuf> },
    /// Run ended without an image. `status` carries the HTTP code, if any.
    Failed {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

impl PipelineState {
    /// Returns true for `Ready` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Failed { .. })
    }

    /// Returns true while a run is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Submitting | Self::Polling { .. } | Self::Fetching { .. }
        )
    }

    /// Short label for status bars and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Submitting => "submitting",
            Self::Polling { .. } => "polling",
            Self::Fetching { .. } => "fetching",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Notifications sent to whoever renders the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// The run moved to a new state.
    StateChanged { run: RunId, state: PipelineState },
    /// The run produced an image.
    ImageReady { run: RunId, artifact: Arc<Artifact> },
    /// Something went wrong; reported once per failure.
    Error {
        run: RunId,
        kind: ErrorKind,
        message: String,
        status: Option<u16>,
    },
}

impl PipelineEvent {
    /// Returns the run this event belongs to.
    pub fn run(&self) -> RunId {
        match self {
            Self::StateChanged { run, .. } | Self::ImageReady { run, .. } | Self::Error { run, .. } => {
                *run
            }
        }
    }
}
