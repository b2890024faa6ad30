//! Runs one download job in the background and reports back over a channel.

use std::{ops::ControlFlow, sync::Arc};

use tokio::{
    runtime::Handle,
    sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel},
};
use tracing::{debug, info, warn};

use crate::{
    downloader::{Extractor, ExtractorConfig},
    error::{ExtractorError, JobError},
    model::{CancelFlag, DownloadJob, JobEvent, JobOutcome, JobState},
    progress::ProgressUpdate,
};

/// Executes `job` to completion and sends its events on `events`.
///
/// Exactly one [`JobEvent::Finished`] is sent, last. Once the cancel flag is
/// seen no further progress is sent.
pub async fn run_job(
    job: DownloadJob,
    extractor: Arc<dyn Extractor>,
    events: UnboundedSender<JobEvent>,
) -> JobOutcome {
    let config = ExtractorConfig::for_job(&job);
    let cancel = job.cancel.clone();
    let progress_tx = events.clone();

    let mut hook = move |update: &ProgressUpdate| {
        if cancel.is_cancelled() {
            return ControlFlow::Break(());
        }
        if let Some(pct) = update.percentage() {
            let _ = progress_tx.send(JobEvent::Progress(pct));
        }
        ControlFlow::Continue(())
    };

    let outcome = match extractor.download(&config, &mut hook).await {
        Ok(()) => JobOutcome::Completed,
        Err(ExtractorError::Aborted) => JobOutcome::Cancelled,
        Err(e) => JobOutcome::Failed(e.to_string()),
    };
    drop(hook);

    info!(url = %job.url, ?outcome, "download finished");
    let _ = events.send(JobEvent::Finished(outcome.clone()));
    outcome
}

/// Handle to one job: its cancel flag, its event stream and its state.
pub struct DownloadRunner {
    job: Option<DownloadJob>,
    cancel: CancelFlag,
    state: JobState,
    events: Option<UnboundedReceiver<JobEvent>>,
}

impl DownloadRunner {
    pub fn new(job: DownloadJob) -> Self {
        Self {
            cancel: job.cancel.clone(),
            job: Some(job),
            state: JobState::Idle,
            events: None,
        }
    }

    /// Spawns the job on `runtime`. Does nothing unless the runner is idle.
    pub fn start(&mut self, extractor: Arc<dyn Extractor>, runtime: &Handle) {
        let Some(job) = self.job.take() else {
            warn!("download runner started twice");
            return;
        };
        let (tx, rx) = unbounded_channel();
        debug!(url = %job.url, format = job.format.label(), "starting download");
        runtime.spawn(run_job(job, extractor, tx));
        self.events = Some(rx);
        self.state = JobState::Running;
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state() == JobState::Running
    }

    /// Drains pending events without blocking.
    pub fn poll_events(&mut self) -> Vec<JobEvent> {
        let mut drained = Vec::new();
        let Some(rx) = self.events.as_mut() else {
            return drained;
        };
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if let JobEvent::Finished(outcome) = &event {
                        self.state = outcome.state();
                    }
                    drained.push(event);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    // the worker died without a terminal event
                    if !self.state.is_terminal() {
                        let outcome = JobOutcome::Failed("download task stopped unexpectedly".into());
                        self.state = outcome.state();
                        drained.push(JobEvent::Finished(outcome));
                    }
                    self.events = None;
                    break;
                }
            }
        }
        drained
    }
}

impl Drop for DownloadRunner {
    // a dropped handle must not leave its job running unobserved
    fn drop(&mut self) {
        if self.is_active() {
            self.cancel();
        }
    }
}

/// Holds the single active download. A new job is refused while one runs.
#[derive(Default)]
pub struct JobSlot {
    current: Option<DownloadRunner>,
}

impl JobSlot {
    pub fn admit(
        &mut self,
        job: DownloadJob,
        extractor: Arc<dyn Extractor>,
        runtime: &Handle,
    ) -> Result<(), JobError> {
        if job.url.trim().is_empty() {
            return Err(JobError::EmptyUrl);
        }
        if self.is_busy() {
            return Err(JobError::Busy);
        }
        let mut runner = DownloadRunner::new(job);
        runner.start(extractor, runtime);
        self.current = Some(runner);
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.current.as_ref().is_some_and(DownloadRunner::is_active)
    }

    /// Returns `false` when there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        match &self.current {
            Some(runner) if runner.is_active() => {
                runner.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn poll(&mut self) -> Vec<JobEvent> {
        self.current
            .as_mut()
            .map(DownloadRunner::poll_events)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        downloader::ProgressHook,
        model::{DownloadFormat, ExecutableLocation, MediaInfo},
    };
    use async_trait::async_trait;
    use std::time::Duration;

    /// Replays a fixed list of checkpoints, or fails straight away.
    struct ScriptedExtractor {
        updates: Vec<ProgressUpdate>,
        failure: Option<String>,
    }

    #[async_trait]
    impl Extractor for ScriptedExtractor {
        async fn download(
            &self,
            _config: &ExtractorConfig,
            hook: &mut ProgressHook<'_>,
        ) -> Result<(), ExtractorError> {
            if let Some(message) = &self.failure {
                return Err(ExtractorError::Failed(message.clone()));
            }
            for update in &self.updates {
                if hook(update).is_break() {
                    return Err(ExtractorError::Aborted);
                }
            }
            Ok(())
        }

        async fn fetch_info(&self, _url: &str) -> Result<MediaInfo, ExtractorError> {
            Ok(MediaInfo::default())
        }
    }

    /// Reports progress forever until the hook stops it.
    struct EndlessExtractor;

    #[async_trait]
    impl Extractor for EndlessExtractor {
        async fn download(
            &self,
            _config: &ExtractorConfig,
            hook: &mut ProgressHook<'_>,
        ) -> Result<(), ExtractorError> {
            let mut downloaded = 0;
            loop {
                downloaded = (downloaded + 1) % 100;
                if hook(&ProgressUpdate::downloading(downloaded, Some(100))).is_break() {
                    return Err(ExtractorError::Aborted);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn fetch_info(&self, _url: &str) -> Result<MediaInfo, ExtractorError> {
            Ok(MediaInfo::default())
        }
    }

    fn job() -> DownloadJob {
        DownloadJob::new(
            "https://media.example/watch?v=abc",
            DownloadFormat::Audio,
            "out",
            ExecutableLocation::new("tools/ffmpeg"),
        )
    }

    fn scripted(updates: Vec<ProgressUpdate>) -> Arc<dyn Extractor> {
        Arc::new(ScriptedExtractor {
            updates,
            failure: None,
        })
    }

    async fn run_collect(job: DownloadJob, extractor: Arc<dyn Extractor>) -> Vec<JobEvent> {
        let (tx, mut rx) = unbounded_channel();
        run_job(job, extractor, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn wait_for_finish(slot: &mut JobSlot) -> (Vec<JobEvent>, JobOutcome) {
        let mut seen = Vec::new();
        for _ in 0..400 {
            for event in slot.poll() {
                if let JobEvent::Finished(outcome) = event {
                    return (seen, outcome);
                }
                seen.push(event);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn reports_progress_then_completion() {
        let updates = vec![
            ProgressUpdate::downloading(0, None),
            ProgressUpdate::downloading(25, Some(100)),
            ProgressUpdate::downloading(100, Some(100)),
        ];
        let events = run_collect(job(), scripted(updates)).await;
        assert_eq!(
            events,
            vec![
                JobEvent::Progress(25.0),
                JobEvent::Progress(100.0),
                JobEvent::Finished(JobOutcome::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn cancel_before_first_checkpoint() {
        let job = job();
        job.cancel.cancel();
        let updates = vec![
            ProgressUpdate::downloading(10, Some(100)),
            ProgressUpdate::downloading(20, Some(100)),
        ];
        let events = run_collect(job, scripted(updates)).await;
        assert_eq!(events, vec![JobEvent::Finished(JobOutcome::Cancelled)]);
    }

    #[tokio::test]
    async fn failure_carries_error_text() {
        let extractor = Arc::new(ScriptedExtractor {
            updates: Vec::new(),
            failure: Some("ERROR: Unsupported URL: not-a-url".to_string()),
        });
        let events = run_collect(job(), extractor).await;
        assert_eq!(
            events,
            vec![JobEvent::Finished(JobOutcome::Failed(
                "ERROR: Unsupported URL: not-a-url".to_string()
            ))]
        );
    }

    #[tokio::test]
    async fn runner_moves_through_states() {
        let mut runner = DownloadRunner::new(job());
        assert_eq!(runner.state(), JobState::Idle);
        assert!(runner.poll_events().is_empty());

        runner.start(scripted(vec![ProgressUpdate::downloading(1, Some(2))]), &Handle::current());
        assert_eq!(runner.state(), JobState::Running);

        let mut events = Vec::new();
        while !runner.state().is_terminal() {
            events.extend(runner.poll_events());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(runner.state(), JobState::Completed);
        assert_eq!(
            events,
            vec![JobEvent::Progress(50.0), JobEvent::Finished(JobOutcome::Completed)]
        );
        assert!(runner.poll_events().is_empty());
    }

    #[tokio::test]
    async fn slot_refuses_second_job_until_first_ends() {
        let runtime = Handle::current();
        let mut slot = JobSlot::default();
        assert!(!slot.cancel());

        slot.admit(job(), Arc::new(EndlessExtractor), &runtime).unwrap();
        assert!(slot.is_busy());
        assert_eq!(
            slot.admit(job(), scripted(Vec::new()), &runtime),
            Err(JobError::Busy)
        );

        assert!(slot.cancel());
        let (_, outcome) = wait_for_finish(&mut slot).await;
        assert_eq!(outcome, JobOutcome::Cancelled);
        assert!(!slot.is_busy());
        assert!(!slot.cancel());

        slot.admit(job(), scripted(Vec::new()), &runtime).unwrap();
        let (progress, outcome) = wait_for_finish(&mut slot).await;
        assert!(progress.is_empty());
        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test]
    async fn slot_rejects_blank_url() {
        let mut slot = JobSlot::default();
        let mut blank = job();
        blank.url = "   ".to_string();
        assert_eq!(
            slot.admit(blank, scripted(Vec::new()), &Handle::current()),
            Err(JobError::EmptyUrl)
        );
        assert!(!slot.is_busy());
    }
}
