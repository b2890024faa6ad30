//! Error types for the bootstrapper, the extractor adapter and job admission.

use std::path::PathBuf;
use thiserror::Error;

/// Failures while making sure ffmpeg is available locally.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Non-success HTTP status or transport error while fetching the archive.
    #[error("Failed to download {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// The archive has no `bin/<executable>` entry.
    #[error("{executable} not found in the downloaded zip archive")]
    ArchiveLayout { executable: String },

    /// Filesystem or zip error while unpacking.
    #[error("Failed to extract {path}: {reason}")]
    Extraction { path: PathBuf, reason: String },

    /// Not on the search path and no archive to download for this platform.
    #[error("{executable} was not found on PATH and no download is configured for this platform")]
    Unavailable { executable: String },

    /// The version self-check could not run or exited with an error.
    #[error("{path} is not usable: {reason}")]
    ExecutableCheck { path: PathBuf, reason: String },
}

/// Failures reported by the extraction program.
#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("yt-dlp was not found in the tools directory or on PATH")]
    NotFound,

    #[error("Failed to execute yt-dlp: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading output from, or waiting on, a running yt-dlp failed.
    #[error("Failed to read yt-dlp output: {0}")]
    Io(#[source] std::io::Error),

    /// The program ran and reported an error.
    #[error("{0}")]
    Failed(String),

    /// The progress hook asked to stop.
    #[error("Download cancelled by user")]
    Aborted,

    #[error("Failed to parse yt-dlp response: {0}")]
    InvalidInfo(#[from] serde_json::Error),
}

/// Reasons a download request is not started.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("A download is already running")]
    Busy,

    #[error("Please enter a valid URL.")]
    EmptyUrl,
}
