use super::*;
use crate::error::ErrorKind;
use crate::image::{JobHandle, JobStatus};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicUsize;
use std::sync::Mutex;
use tokio::sync::Notify;

const IMAGE: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 7, 7, 7];

/// Scripted backend. Job ids are `job-1`, `job-2`, ... in creation order;
/// each job answers polls from its script and then stays `Pending`.
#[derive(Default)]
struct MockBackend {
    create_status: Option<u16>,
    poll_status: Option<u16>,
    fetch_status: Option<u16>,
    scripts: Mutex<HashMap<String, VecDeque<JobStatus>>>,
    gates: Mutex<HashMap<String, (Arc<Notify>, Arc<Notify>)>>,
    created: AtomicUsize,
    polls: AtomicUsize,
    fetches: Mutex<Vec<String>>,
}

impl MockBackend {
    fn script(self, job_id: &str, statuses: Vec<JobStatus>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_id.to_string(), statuses.into());
        self
    }

    /// Holds the first poll of `job_id` until `release` is notified;
    /// `entered` fires once the poll is in flight.
    fn gate(self, job_id: &str) -> (Self, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        self.gates.lock().unwrap().insert(
            job_id.to_string(),
            (Arc::clone(&entered), Arc::clone(&release)),
        );
        (self, entered, release)
    }

    fn network_calls(&self) -> usize {
        self.created.load(Ordering::SeqCst)
            + self.polls.load(Ordering::SeqCst)
            + self.fetches.lock().unwrap().len()
    }
}

fn ready(job_id: &str) -> JobStatus {
    JobStatus::Ready {
        sample_url: format!("https://delivery.example/{job_id}/sample.png"),
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn create_job(&self, request: &GenerationRequest) -> Result<JobHandle> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        match self.create_status {
            Some(401) => Err(FluxViewError::Auth("Not authenticated".into())),
            Some(status) => Err(FluxViewError::Validation {
                status,
                message: "rejected".into(),
            }),
            None => Ok(JobHandle {
                id: format!("job-{n}"),
                submitted_at: chrono::Utc::now(),
                request: request.clone(),
            }),
        }
    }

    async fn poll_job(&self, id: &str) -> Result<JobStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.poll_status {
            return Err(FluxViewError::Http {
                status,
                message: "bad gateway".into(),
            });
        }

        let gate = self.gates.lock().unwrap().remove(id);
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(|script| script.pop_front());
        Ok(next.unwrap_or(JobStatus::Pending))
    }

    async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
        self.fetches.lock().unwrap().push(url.to_string());
        match self.fetch_status {
            Some(status) => Err(FluxViewError::Fetch { status }),
            None => Ok(IMAGE.to_vec()),
        }
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        auto_save: false,
        ..PipelineConfig::default()
    }
}

fn pipeline_with(
    backend: &Arc<MockBackend>,
    config: PipelineConfig,
    store: ArtifactStore,
) -> (JobPipeline, mpsc::UnboundedReceiver<PipelineEvent>) {
    JobPipeline::builder(Arc::clone(backend))
        .config(config)
        .artifact_store(store)
        .build()
        .unwrap()
}

/// Receives events until `run` publishes an image or fails.
async fn until_finished(
    rx: &mut mpsc::UnboundedReceiver<PipelineEvent>,
    run: RunId,
) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("run did not finish")
            .expect("event channel closed");
        let done = event.run() == run
            && matches!(
                &event,
                PipelineEvent::ImageReady { .. }
                    | PipelineEvent::StateChanged {
                        state: PipelineState::Failed { .. },
                        ..
                    }
            );
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Lets the paused clock run long enough for any stray task to act.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(30)).await;
}

fn states(events: &[PipelineEvent]) -> Vec<&'static str> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged { state, .. } => Some(state.label()),
            _ => None,
        })
        .collect()
}

fn images(events: &[PipelineEvent]) -> Vec<&Arc<Artifact>> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::ImageReady { artifact, .. } => Some(artifact),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn pending_then_ready_delivers_exactly_one_image() {
    let temp = tempfile::tempdir().unwrap();
    let backend = Arc::new(MockBackend::default().script(
        "job-1",
        vec![JobStatus::Pending, JobStatus::Pending, ready("job-1")],
    ));
    let (pipeline, mut rx) = pipeline_with(
        &backend,
        PipelineConfig::default(),
        ArtifactStore::new(temp.path()),
    );

    let run = pipeline
        .submit(GenerationRequest::new("A lighthouse").with_aspect_ratio(AspectRatio::Landscape))
        .unwrap();
    let events = until_finished(&mut rx, run).await;

    assert_eq!(
        states(&events),
        vec!["submitting", "polling", "fetching", "ready"]
    );
    let delivered = images(&events);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].bytes, IMAGE);
    assert_eq!(
        delivered[0].source_url,
        "https://delivery.example/job-1/sample.png"
    );
    assert_eq!(backend.polls.load(Ordering::SeqCst), 3);

    // auto-save wrote the same bytes into the dated tree
    let saved = delivered[0].saved_path.clone().expect("auto-saved");
    assert!(saved.starts_with(temp.path().join("outputs")));
    assert_eq!(std::fs::read(&saved).unwrap(), IMAGE);
    assert_eq!(
        pipeline.state(),
        PipelineState::Ready {
            saved_path: Some(saved)
        }
    );

    settle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn empty_prompt_is_rejected_without_network_calls() {
    let backend = Arc::new(MockBackend::default());
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let err = pipeline.submit(GenerationRequest::new("")).unwrap_err();
    assert!(matches!(err, FluxViewError::InvalidRequest(_)));
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    settle().await;
    assert_eq!(backend.network_calls(), 0);
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.current_run(), None);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn disabled_options_are_rejected_without_network_calls() {
    let backend = Arc::new(MockBackend::default());
    let config = PipelineConfig {
        raw_mode: false,
        aspect_ratios: vec![AspectRatio::Square, AspectRatio::Standard],
        ..quiet_config()
    };
    let (pipeline, _rx) = pipeline_with(&backend, config, ArtifactStore::new("."));

    assert!(matches!(
        pipeline.submit(GenerationRequest::new("A fox").with_raw(true)),
        Err(FluxViewError::InvalidRequest(_))
    ));
    assert!(matches!(
        pipeline.submit(GenerationRequest::new("A fox").with_aspect_ratio(AspectRatio::Ultrawide)),
        Err(FluxViewError::InvalidRequest(_))
    ));

    settle().await;
    assert_eq!(backend.network_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_create_fails_without_polling() {
    let backend = Arc::new(MockBackend {
        create_status: Some(401),
        ..MockBackend::default()
    });
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    let events = until_finished(&mut rx, run).await;

    assert_eq!(states(&events), vec!["submitting", "failed"]);
    assert!(matches!(
        pipeline.state(),
        PipelineState::Failed {
            kind: ErrorKind::Auth,
            ..
        }
    ));

    // the failure is reported exactly once
    let report = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        report,
        PipelineEvent::Error {
            kind: ErrorKind::Auth,
            ..
        }
    ));

    settle().await;
    assert!(rx.try_recv().is_err());
    assert_eq!(backend.polls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn second_submit_discards_first_run_results() {
    let (backend, entered, release) = MockBackend::default()
        .script("job-1", vec![ready("job-1")])
        .script("job-2", vec![JobStatus::Pending, ready("job-2")])
        .gate("job-1");
    let backend = Arc::new(backend);
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let first = pipeline.submit(GenerationRequest::new("first")).unwrap();
    // first run's poll is now in flight and will answer Ready
    entered.notified().await;

    let second = pipeline.submit(GenerationRequest::new("second")).unwrap();
    assert!(second > first);
    assert_eq!(pipeline.current_run(), Some(second));
    release.notify_one();

    let events = until_finished(&mut rx, second).await;
    settle().await;
    let mut all = events;
    while let Ok(event) = rx.try_recv() {
        all.push(event);
    }

    // nothing from the first run after it was superseded
    let first_events: Vec<_> = all.iter().filter(|e| e.run() == first).collect();
    assert!(first_events.iter().all(|e| matches!(
        e,
        PipelineEvent::StateChanged {
            state: PipelineState::Submitting | PipelineState::Polling { .. },
            ..
        }
    )));

    let delivered = images(&all);
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        delivered[0].source_url,
        "https://delivery.example/job-2/sample.png"
    );
    assert_eq!(
        *backend.fetches.lock().unwrap(),
        vec!["https://delivery.example/job-2/sample.png".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_polling() {
    let backend = Arc::new(MockBackend::default());
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    loop {
        let event = rx.recv().await.unwrap();
        if let PipelineEvent::StateChanged {
            state: PipelineState::Polling { .. },
            ..
        } = event
        {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert_eq!(pipeline.cancel(), Some(run));
    let polls_at_cancel = backend.polls.load(Ordering::SeqCst);
    assert!(polls_at_cancel >= 2);

    let idle = rx.recv().await.unwrap();
    assert!(matches!(
        idle,
        PipelineEvent::StateChanged {
            state: PipelineState::Idle,
            ..
        }
    ));

    settle().await;
    assert_eq!(backend.polls.load(Ordering::SeqCst), polls_at_cancel);
    assert_eq!(pipeline.state(), PipelineState::Idle);
    assert_eq!(pipeline.current_run(), None);
    assert!(rx.try_recv().is_err());
    assert_eq!(pipeline.cancel(), None);
}

#[tokio::test(start_paused = true)]
async fn remote_failure_ends_run() {
    let backend = Arc::new(MockBackend::default().script(
        "job-1",
        vec![
            JobStatus::Pending,
            JobStatus::Failed {
                reason: "Content Moderated".into(),
            },
        ],
    ));
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    until_finished(&mut rx, run).await;

    match pipeline.state() {
        PipelineState::Failed {
            kind,
            message,
            status,
        } => {
            assert_eq!(kind, ErrorKind::Remote);
            assert_eq!(status, None);
            assert!(message.contains("Content Moderated"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(backend.fetches.lock().unwrap().is_empty());

    settle().await;
    assert_eq!(backend.polls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn download_error_keeps_status_code() {
    let backend = Arc::new(MockBackend {
        fetch_status: Some(410),
        ..MockBackend::default()
    }
    .script("job-1", vec![ready("job-1")]));
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    let events = until_finished(&mut rx, run).await;

    assert_eq!(
        states(&events),
        vec!["submitting", "polling", "fetching", "failed"]
    );
    match pipeline.state() {
        PipelineState::Failed {
            kind,
            message,
            status,
        } => {
            assert_eq!(kind, ErrorKind::Fetch);
            assert_eq!(status, Some(410));
            assert!(message.contains("410"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(pipeline.artifact().is_none());

    let report = rx.recv().await.unwrap();
    assert!(matches!(
        report,
        PipelineEvent::Error {
            kind: ErrorKind::Fetch,
            status: Some(410),
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn poll_error_ends_run_without_fetching() {
    let backend = Arc::new(MockBackend {
        poll_status: Some(502),
        ..MockBackend::default()
    });
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    let events = until_finished(&mut rx, run).await;

    assert_eq!(states(&events), vec!["submitting", "polling", "failed"]);
    assert_eq!(
        pipeline.state(),
        PipelineState::Failed {
            kind: ErrorKind::Network,
            message: "API error: 502 - bad gateway".into(),
            status: Some(502),
        }
    );

    settle().await;
    let mut reports = Vec::new();
    while let Ok(event) = rx.try_recv() {
        reports.push(event);
    }
    assert_eq!(reports.len(), 1);
    assert!(matches!(
        reports[0],
        PipelineEvent::Error {
            kind: ErrorKind::Network,
            status: Some(502),
            ..
        }
    ));
    assert_eq!(backend.polls.load(Ordering::SeqCst), 1);
    assert!(backend.fetches.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auto_save_failure_still_reaches_ready() {
    let temp = tempfile::tempdir().unwrap();
    let blocker = temp.path().join("not_a_dir");
    std::fs::write(&blocker, b"file").unwrap();

    let backend = Arc::new(MockBackend::default().script("job-1", vec![ready("job-1")]));
    let (pipeline, mut rx) = pipeline_with(
        &backend,
        PipelineConfig::default(),
        ArtifactStore::new(&blocker),
    );

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    let events = until_finished(&mut rx, run).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Error {
            kind: ErrorKind::Io,
            ..
        }
    )));
    assert_eq!(
        pipeline.state(),
        PipelineState::Ready { saved_path: None }
    );
    assert_eq!(images(&events).len(), 1);

    // the in-memory image can still be saved elsewhere
    let target = temp.path().join("manual/fox.png");
    assert_eq!(pipeline.save(Some(target.as_path())).unwrap(), target);
    assert_eq!(std::fs::read(&target).unwrap(), IMAGE);
    assert_eq!(
        pipeline.state(),
        PipelineState::Ready { saved_path: None }
    );
}

#[tokio::test(start_paused = true)]
async fn poll_budget_turns_into_timeout() {
    let backend = Arc::new(MockBackend::default());
    let config = PipelineConfig {
        max_poll_attempts: Some(3),
        ..quiet_config()
    };
    let (pipeline, mut rx) = pipeline_with(&backend, config, ArtifactStore::new("."));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    until_finished(&mut rx, run).await;

    match pipeline.state() {
        PipelineState::Failed { kind, message, .. } => {
            assert_eq!(kind, ErrorKind::Network);
            assert!(message.contains("did not finish"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(backend.polls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn reads_after_ready_do_not_touch_state() {
    let backend = Arc::new(MockBackend::default().script("job-1", vec![ready("job-1")]));
    let (pipeline, mut rx) = pipeline_with(&backend, quiet_config(), ArtifactStore::new("."));

    assert!(matches!(
        pipeline.save(None),
        Err(FluxViewError::InvalidRequest(_))
    ));

    let run = pipeline.submit(GenerationRequest::new("A fox")).unwrap();
    until_finished(&mut rx, run).await;
    let before = pipeline.state();

    let again = pipeline.refetch().await.unwrap();
    assert_eq!(again, IMAGE);
    let again = pipeline.refetch().await.unwrap();
    assert_eq!(again, IMAGE);

    assert_eq!(pipeline.state(), before);
    assert_eq!(pipeline.current_run(), Some(run));
    assert!(rx.try_recv().is_err());
    assert_eq!(backend.fetches.lock().unwrap().len(), 3);
}

#[test]
fn build_outside_runtime_needs_handle() {
    let result = JobPipeline::builder(MockBackend::default()).build();
    assert!(matches!(result, Err(FluxViewError::Config(_))));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();
    let result = JobPipeline::builder(MockBackend::default())
        .runtime(runtime.handle().clone())
        .build();
    assert!(result.is_ok());
}
