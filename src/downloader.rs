//! Adapter around the external `yt-dlp` program.

use std::{ops::ControlFlow, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    error::ExtractorError,
    model::{DownloadFormat, DownloadJob, ExecutableLocation, MediaInfo},
    progress::{ProgressUpdate, parse_progress_from_line, progress_template},
};

/// Called on every progress checkpoint; `Break` stops the download.
pub type ProgressHook<'a> = dyn FnMut(&ProgressUpdate) -> ControlFlow<()> + Send + 'a;

/// Step run by ffmpeg after the streams are retrieved
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PostProcessor {
    /// Convert to an audio-only file
    ExtractAudio { codec: String, quality: String },
    /// Mux separate video and audio streams into one container
    Merge { container: String },
}

/// Everything the extractor needs for one download
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractorConfig {
    pub url: String,
    /// yt-dlp output template, e.g. `<dir>/%(title)s.%(ext)s`
    pub output_template: String,
    pub quiet: bool,
    pub ffmpeg_location: ExecutableLocation,
    /// yt-dlp format selector
    pub format: String,
    pub postprocessors: Vec<PostProcessor>,
}

impl ExtractorConfig {
    pub fn for_job(job: &DownloadJob) -> Self {
        let output_template = job
            .output_dir
            .join("%(title)s.%(ext)s")
            .to_string_lossy()
            .into_owned();
        let (format, postprocessors) = match job.format {
            DownloadFormat::Audio => (
                "bestaudio/best",
                vec![PostProcessor::ExtractAudio {
                    codec: "mp3".to_string(),
                    quality: "192".to_string(),
                }],
            ),
            DownloadFormat::Video => (
                "bestvideo+bestaudio/best",
                vec![PostProcessor::Merge {
                    container: "mp4".to_string(),
                }],
            ),
        };
        Self {
            url: job.url.clone(),
            output_template,
            quiet: true,
            ffmpeg_location: job.ffmpeg.clone(),
            format: format.to_string(),
            postprocessors,
        }
    }

    /// Command line for `yt-dlp`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-f".to_owned(),
            self.format.clone(),
            "-o".to_owned(),
            self.output_template.clone(),
            "--ffmpeg-location".to_owned(),
            self.ffmpeg_location.to_string(),
            "--no-playlist".to_owned(),
        ];

        if self.quiet {
            args.push("--quiet".to_owned());
            args.push("--no-warnings".to_owned());
        }
        // progress lines are still printed in quiet mode with --progress
        args.push("--progress".to_owned());
        args.push("--newline".to_owned());
        args.push("--progress-template".to_owned());
        args.push(progress_template());

        for step in &self.postprocessors {
            match step {
                PostProcessor::ExtractAudio { codec, quality } => {
                    args.push("--extract-audio".to_owned());
                    args.push("--audio-format".to_owned());
                    args.push(codec.clone());
                    args.push("--audio-quality".to_owned());
                    args.push(format!("{quality}K"));
                }
                PostProcessor::Merge { container } => {
                    args.push("--merge-output-format".to_owned());
                    args.push(container.clone());
                }
            }
        }

        args.push("--".to_owned());
        args.push(self.url.clone());
        args
    }
}

/// The media extraction/download program.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Runs one download, invoking `hook` on each progress checkpoint.
    ///
    /// Returns [`ExtractorError::Aborted`] when the hook breaks.
    async fn download(
        &self,
        config: &ExtractorConfig,
        hook: &mut ProgressHook<'_>,
    ) -> Result<(), ExtractorError>;

    async fn fetch_info(&self, url: &str) -> Result<MediaInfo, ExtractorError>;
}

pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Configured program, then the tools directory, then `PATH`.
    pub fn locate(config: &AppConfig) -> Result<Self, ExtractorError> {
        if let Some(program) = &config.ytdlp_program {
            return Ok(Self::new(program));
        }
        let bin = if cfg!(target_os = "windows") { "yt-dlp.exe" } else { "yt-dlp" };
        let bundled = config.tools_dir.join(bin);
        if bundled.is_file() {
            return Ok(Self::new(bundled));
        }
        which::which("yt-dlp")
            .map(Self::new)
            .map_err(|_| ExtractorError::NotFound)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl Extractor for YtDlp {
    async fn download(
        &self,
        config: &ExtractorConfig,
        hook: &mut ProgressHook<'_>,
    ) -> Result<(), ExtractorError> {
        let args = config.to_args();
        debug!(program = %self.program().display(), ?args, "spawning yt-dlp");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ExtractorError::Spawn)?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExtractorError::Failed("yt-dlp output was not captured".to_string()));
        };
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_open = true;
        let mut err_open = true;
        let mut last_error: Option<String> = None;

        while out_open || err_open {
            let line = tokio::select! {
                line = out_lines.next_line(), if out_open => match line.map_err(ExtractorError::Io)? {
                    Some(line) => line,
                    None => { out_open = false; continue; }
                },
                line = err_lines.next_line(), if err_open => match line.map_err(ExtractorError::Io)? {
                    Some(line) => line,
                    None => { err_open = false; continue; }
                },
            };

            if let Some(update) = parse_progress_from_line(&line) {
                if hook(&update).is_break() {
                    debug!("progress hook requested stop, killing yt-dlp");
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill yt-dlp: {e}");
                    }
                    return Err(ExtractorError::Aborted);
                }
            } else if !line.trim().is_empty() {
                debug!("yt-dlp> {line}");
                // an ERROR: line is kept over anything printed after it
                let seen_error = last_error.as_deref().is_some_and(|l| l.starts_with("ERROR:"));
                if line.starts_with("ERROR:") || !seen_error {
                    last_error = Some(line);
                }
            }
        }

        let status = child.wait().await.map_err(ExtractorError::Io)?;
        if status.success() {
            Ok(())
        } else {
            Err(ExtractorError::Failed(
                last_error.unwrap_or_else(|| format!("yt-dlp exited with {status}")),
            ))
        }
    }

    async fn fetch_info(&self, url: &str) -> Result<MediaInfo, ExtractorError> {
        let output = Command::new(&self.program)
            .args(["-J", "--skip-download", "--no-playlist", "--no-warnings", "--", url])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(ExtractorError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.lines().last().unwrap_or("yt-dlp failed.");
            return Err(ExtractorError::Failed(message.to_string()));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(format: DownloadFormat) -> DownloadJob {
        DownloadJob::new(
            "https://media.example/watch?v=abc",
            format,
            PathBuf::from("out"),
            ExecutableLocation::new("tools/ffmpeg"),
        )
    }

    #[test]
    fn audio_job_extracts_mp3() {
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Audio));
        assert_eq!(config.format, "bestaudio/best");
        assert_eq!(
            config.postprocessors,
            vec![PostProcessor::ExtractAudio {
                codec: "mp3".into(),
                quality: "192".into()
            }]
        );
        assert_eq!(
            PathBuf::from(&config.output_template),
            PathBuf::from("out").join("%(title)s.%(ext)s")
        );

        let args = config.to_args();
        let joined = args.join(" ");
        assert!(joined.contains("--extract-audio --audio-format mp3 --audio-quality 192K"));
        assert!(!joined.contains("--merge-output-format"));
        assert!(joined.contains(&format!("--ffmpeg-location {}", config.ffmpeg_location)));
        assert_eq!(args.last().unwrap(), "https://media.example/watch?v=abc");
    }

    #[test]
    fn video_job_merges_mp4() {
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Video));
        assert_eq!(config.format, "bestvideo+bestaudio/best");

        let args = config.to_args();
        let merge = args.iter().position(|a| a == "--merge-output-format").unwrap();
        assert_eq!(args[merge + 1], "mp4");
        assert!(!args.contains(&"--extract-audio".to_string()));
    }

    #[test]
    fn quiet_mode_keeps_progress_template() {
        let args = ExtractorConfig::for_job(&job(DownloadFormat::Audio)).to_args();
        assert!(args.contains(&"--quiet".to_string()));
        let template = args.iter().position(|a| a == "--progress-template").unwrap();
        assert_eq!(args[template + 1], progress_template());
    }

    #[test]
    fn configured_program_wins() {
        let config = AppConfig {
            ytdlp_program: Some(PathBuf::from("/custom/yt-dlp")),
            ..AppConfig::default()
        };
        let ytdlp = YtDlp::locate(&config).unwrap();
        assert_eq!(ytdlp.program(), &PathBuf::from("/custom/yt-dlp"));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let ytdlp = YtDlp::new("/definitely/not/here/yt-dlp");
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Audio));
        let mut hook = |_: &ProgressUpdate| ControlFlow::Continue(());
        let err = ytdlp.download(&config, &mut hook).await.unwrap_err();
        assert!(matches!(err, ExtractorError::Spawn(_)));
    }

    #[test]
    fn read_failures_are_not_reported_as_spawn() {
        let read = ExtractorError::Io(std::io::Error::other("pipe closed"));
        let spawn = ExtractorError::Spawn(std::io::Error::other("pipe closed"));
        assert_eq!(read.to_string(), "Failed to read yt-dlp output: pipe closed");
        assert_ne!(read.to_string(), spawn.to_string());
    }

    /// A stand-in `yt-dlp` that runs `body` as a shell script.
    #[cfg(unix)]
    fn fake_ytdlp(dir: &tempfile::TempDir, body: &str) -> YtDlp {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        YtDlp::new(path)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_line_wins_over_later_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let ytdlp = fake_ytdlp(
            &dir,
            "echo 'mdl-progress:downloading:NA:NA:NA'\n\
             echo 'mdl-progress:downloading:50:100:NA'\n\
             echo 'ERROR: Unsupported URL: u' >&2\n\
             echo 'trailing' >&2\n\
             exit 1",
        );
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Audio));
        let mut seen = Vec::new();
        let mut hook = |update: &ProgressUpdate| {
            seen.push(update.percentage());
            ControlFlow::Continue(())
        };

        let err = ytdlp.download(&config, &mut hook).await.unwrap_err();
        match err {
            ExtractorError::Failed(message) => assert_eq!(message, "ERROR: Unsupported URL: u"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(seen, vec![None, Some(50.0)]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_failure_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let ytdlp = fake_ytdlp(&dir, "exit 3");
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Video));
        let mut hook = |_: &ProgressUpdate| ControlFlow::Continue(());

        match ytdlp.download(&config, &mut hook).await {
            Err(ExtractorError::Failed(message)) => {
                assert!(message.starts_with("yt-dlp exited with"), "{message}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ytdlp = fake_ytdlp(&dir, "echo 'mdl-progress:finished:10:10:NA'\nexit 0");
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Audio));
        let mut calls = 0;
        let mut hook = |_: &ProgressUpdate| {
            calls += 1;
            ControlFlow::Continue(())
        };

        ytdlp.download(&config, &mut hook).await.unwrap();
        assert_eq!(calls, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hook_break_kills_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let ytdlp = fake_ytdlp(
            &dir,
            "while true; do echo 'mdl-progress:downloading:1:100:NA'; sleep 0.05; done",
        );
        let config = ExtractorConfig::for_job(&job(DownloadFormat::Audio));
        let mut calls = 0;
        let mut hook = |_: &ProgressUpdate| {
            calls += 1;
            if calls == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            ytdlp.download(&config, &mut hook),
        )
        .await
        .expect("download did not stop after the hook broke");
        assert!(matches!(result, Err(ExtractorError::Aborted)));
        assert_eq!(calls, 3);
    }
}
