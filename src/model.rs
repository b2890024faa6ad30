use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde::Deserialize;

/// Output format chosen in the form
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownloadFormat {
    /// Best audio stream, converted to MP3
    #[default]
    Audio,
    /// Best video and audio streams, merged into MP4
    Video,
}

impl DownloadFormat {
    pub fn label(self) -> &'static str {
        match self {
            DownloadFormat::Audio => "MP3",
            DownloadFormat::Video => "MP4",
        }
    }
}

/// Path to a required external binary, produced by the bootstrapper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableLocation(PathBuf);

impl ExecutableLocation {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ExecutableLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Set-once cancellation flag shared between the UI and a job's worker.
///
/// The UI side only ever calls [`CancelFlag::cancel`]; the worker only reads.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One user-requested download
#[derive(Clone, Debug)]
pub struct DownloadJob {
    /// Media URL as typed by the user
    pub url: String,
    pub format: DownloadFormat,
    /// Folder the finished file is written to
    pub output_dir: PathBuf,
    /// ffmpeg used by the post-processing steps
    pub ffmpeg: ExecutableLocation,
    pub cancel: CancelFlag,
}

impl DownloadJob {
    pub fn new(
        url: impl Into<String>,
        format: DownloadFormat,
        output_dir: impl Into<PathBuf>,
        ffmpeg: ExecutableLocation,
    ) -> Self {
        Self {
            url: url.into(),
            format,
            output_dir: output_dir.into(),
            ffmpeg,
            cancel: CancelFlag::default(),
        }
    }
}

/// Lifecycle of a download runner
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}

/// How a job ended
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
    /// Error text reported by the extractor
    Failed(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Completed => JobState::Completed,
            JobOutcome::Cancelled => JobState::Cancelled,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }
}

/// Notification sent from a job's worker to the UI
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    /// Percentage in `0.0..=100.0`
    Progress(f32),
    /// Terminal notification; nothing follows it
    Finished(JobOutcome),
}

/// Metadata shown by "Fetch Info"
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct MediaInfo {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    /// Seconds; yt-dlp reports fractional values for some sites
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl MediaInfo {
    pub fn summary(&self) -> String {
        format!(
            "Title: {}\nUploader: {}\nDuration: {} seconds",
            self.title.as_deref().unwrap_or("N/A"),
            self.uploader.as_deref().unwrap_or("N/A"),
            self.duration.map(|d| d.round() as u64).unwrap_or(0),
        )
    }
}
