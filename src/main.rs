//! Desktop media downloader: paste a URL, pick MP3 or MP4, download.

// ffmpeg lookup, download and unpacking
mod bootstrap;
// Defaults and environment overrides
mod config;
// yt-dlp adapter
mod downloader;
mod error;
// Data models for jobs and their events
mod model;
// Progress line parsing
mod progress;
// Background job execution and admission
mod runner;
// Thumbnail fetching for "Fetch Info"
mod thumbnail;

use std::{
    path::PathBuf,
    sync::Arc,
    task::Poll,
};

use bootstrap::{HttpArchiveSource, ensure_executable, verify_executable};
use config::AppConfig;
use downloader::{Extractor, YtDlp};
use error::{BootstrapError, ExtractorError, JobError};
use model::{DownloadFormat, DownloadJob, ExecutableLocation, JobEvent, JobOutcome, MediaInfo};
use runner::JobSlot;

// eframe/egui for GUI application framework
use eframe::{App, Frame, egui};
use egui::{Color32, ColorImage, TextureOptions, Visuals};
// OnceCell for single-time runtime initialization
use once_cell::sync::OnceCell;
// FileDialog for folder selection dialogs
use rfd::FileDialog;
use tokio::{
    runtime::{Handle, Runtime},
    sync::mpsc::{UnboundedReceiver, error::TryRecvError, unbounded_channel},
};
use tracing::{info, warn};

// Global Tokio runtime stored in a OnceCell for lazy init
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

type BootstrapReply = Result<(ExecutableLocation, String), BootstrapError>;

/// Program entry point: initializes logging and runtime, then launches the GUI
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = RUNTIME.get_or_try_init(Runtime::new)?.handle().clone();
    let config = AppConfig::from_env();
    info!(tools_dir = %config.tools_dir.display(), "starting media downloader");

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([600.0, 450.0]),
        ..Default::default()
    };
    eframe::run_native(
        "Media Downloader",
        options,
        Box::new(move |cc| {
            // Black and purple dark theme
            let mut visuals = Visuals::dark();
            visuals.panel_fill = Color32::BLACK;
            visuals.selection.bg_fill = Color32::from_rgb(0x80, 0x00, 0x80);
            cc.egui_ctx.set_visuals(visuals);
            Box::new(MediaDownloaderApp::new(config, runtime))
        }),
    )?;
    Ok(())
}

/// Download request waiting for the ffmpeg bootstrap to finish
struct PendingDownload {
    url: String,
    format: DownloadFormat,
    output_dir: PathBuf,
}

/// Application state for the GUI
struct MediaDownloaderApp {
    runtime: Handle,
    config: AppConfig,
    /// Input field for the media URL
    url_input: String,
    /// Destination folder for downloads
    output_dir: String,
    format: DownloadFormat,
    /// Progress bar value (0.0 to 1.0)
    progress: f32,
    log: Vec<String>,
    /// ffmpeg resolved once per session
    ffmpeg: Option<ExecutableLocation>,
    bootstrap_rx: Option<UnboundedReceiver<BootstrapReply>>,
    pending: Option<PendingDownload>,
    jobs: JobSlot,
    info_rx: Option<UnboundedReceiver<Result<MediaInfo, ExtractorError>>>,
    thumbnail_rx: Option<UnboundedReceiver<ColorImage>>,
    thumbnail: Option<egui::TextureHandle>,
}

impl MediaDownloaderApp {
    fn new(config: AppConfig, runtime: Handle) -> Self {
        Self {
            runtime,
            url_input: String::new(),
            output_dir: config.output_dir.display().to_string(),
            config,
            format: DownloadFormat::Audio,
            progress: 0.0,
            log: Vec::new(),
            ffmpeg: None,
            bootstrap_rx: None,
            pending: None,
            jobs: JobSlot::default(),
            info_rx: None,
            thumbnail_rx: None,
            thumbnail: None,
        }
    }

    fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(target: "media_downloader::ui", "{line}");
        self.log.push(line);
    }

    fn extractor(&self) -> Result<Arc<dyn Extractor>, ExtractorError> {
        YtDlp::locate(&self.config).map(|ytdlp| Arc::new(ytdlp) as Arc<dyn Extractor>)
    }

    fn start_download(&mut self, ctx: &egui::Context) {
        if self.jobs.is_busy() || self.pending.is_some() {
            self.log(JobError::Busy.to_string());
            return;
        }
        let url = self.url_input.trim().to_string();
        if url.is_empty() {
            self.log(JobError::EmptyUrl.to_string());
            return;
        }
        let request = PendingDownload {
            url,
            format: self.format,
            output_dir: PathBuf::from(self.output_dir.trim()),
        };

        if let Some(ffmpeg) = self.ffmpeg.clone() {
            self.launch(request, ffmpeg);
            return;
        }

        self.log("Checking for FFmpeg in the scripts directory...");
        let (tx, rx) = unbounded_channel();
        let bootstrap = self.config.bootstrap();
        let ctx = ctx.clone();
        self.runtime.spawn_blocking(move || {
            let reply = ensure_executable(&bootstrap, &HttpArchiveSource).and_then(|location| {
                verify_executable(&location).map(|version| (location, version))
            });
            let _ = tx.send(reply);
            ctx.request_repaint();
        });
        self.bootstrap_rx = Some(rx);
        self.pending = Some(request);
    }

    fn launch(&mut self, request: PendingDownload, ffmpeg: ExecutableLocation) {
        let extractor = match self.extractor() {
            Ok(extractor) => extractor,
            Err(e) => {
                self.log(format!("Error: {e}"));
                return;
            }
        };
        let job = DownloadJob::new(request.url, request.format, request.output_dir, ffmpeg);
        match self.jobs.admit(job, extractor, &self.runtime) {
            Ok(()) => {
                self.progress = 0.0;
                self.log("Starting download...");
            }
            Err(e) => self.log(e.to_string()),
        }
    }

    fn cancel_download(&mut self) {
        if self.jobs.cancel() {
            self.log("Cancelling download...");
        } else {
            self.log("No active download to cancel.");
        }
    }

    fn fetch_info(&mut self, ctx: &egui::Context) {
        // one lookup at a time, the pending reply would be dropped otherwise
        if self.info_rx.is_some() {
            self.log("Already fetching video info...");
            return;
        }
        let url = self.url_input.trim().to_string();
        if url.is_empty() {
            self.log("Please enter a valid URL to fetch info.");
            return;
        }
        let extractor = match self.extractor() {
            Ok(extractor) => extractor,
            Err(e) => {
                self.log(format!("Error fetching info: {e}"));
                return;
            }
        };
        self.log("Fetching video info...");
        let (tx, rx) = unbounded_channel();
        let ctx = ctx.clone();
        self.runtime.spawn(async move {
            let _ = tx.send(extractor.fetch_info(&url).await);
            ctx.request_repaint();
        });
        self.info_rx = Some(rx);
    }

    fn on_bootstrap(&mut self, reply: BootstrapReply) {
        match reply {
            Ok((location, version)) => {
                info!(path = %location, %version, "ffmpeg ready");
                self.log("FFmpeg check passed using the scripts directory.");
                self.ffmpeg = Some(location.clone());
                if let Some(request) = self.pending.take() {
                    self.launch(request, location);
                }
            }
            Err(e) => {
                self.pending = None;
                let message = match e {
                    BootstrapError::ExecutableCheck { .. } => {
                        format!("Error: FFmpeg is not accessible from the scripts directory. {e}")
                    }
                    _ => format!("Error: FFmpeg could not be installed automatically. {e}"),
                };
                self.log(message);
            }
        }
    }

    fn on_info(&mut self, ctx: &egui::Context, reply: Result<MediaInfo, ExtractorError>) {
        match reply {
            Ok(info) => {
                self.log(info.summary());
                self.thumbnail = None;
                if let Some(url) = info.thumbnail {
                    let (tx, rx) = unbounded_channel();
                    let ctx = ctx.clone();
                    self.runtime.spawn_blocking(move || {
                        if let Some(img) = thumbnail::fetch_thumbnail(&url) {
                            let _ = tx.send(img);
                            ctx.request_repaint();
                        }
                    });
                    self.thumbnail_rx = Some(rx);
                }
            }
            Err(e) => self.log(format!("Error fetching info: {e}")),
        }
    }

    fn on_job_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::Progress(pct) => {
                self.progress = (pct / 100.0).clamp(0.0, 1.0);
                self.log(format!("Download progress: {pct:.2}%"));
            }
            JobEvent::Finished(JobOutcome::Completed) => {
                self.progress = 1.0;
                self.log("Download finished!");
            }
            JobEvent::Finished(JobOutcome::Cancelled) => self.log("Download cancelled."),
            JobEvent::Finished(JobOutcome::Failed(message)) => self.log(format!("Error: {message}")),
        }
    }

    /// Drains every background reply without blocking the UI thread.
    fn poll_background(&mut self, ctx: &egui::Context) {
        match take_reply(&mut self.bootstrap_rx) {
            Poll::Ready(Some(reply)) => self.on_bootstrap(reply),
            Poll::Ready(None) => {
                warn!("ffmpeg setup task ended without a result");
                self.pending = None;
                self.log("Error: FFmpeg could not be installed automatically.");
            }
            Poll::Pending => {}
        }

        for event in self.jobs.poll() {
            self.on_job_event(event);
        }

        match take_reply(&mut self.info_rx) {
            Poll::Ready(Some(reply)) => self.on_info(ctx, reply),
            Poll::Ready(None) => self.log("Error fetching info: task ended unexpectedly"),
            Poll::Pending => {}
        }

        // A failed thumbnail fetch just leaves the slot empty
        if let Poll::Ready(Some(img)) = take_reply(&mut self.thumbnail_rx) {
            self.thumbnail = Some(ctx.load_texture("thumbnail", img, TextureOptions::default()));
        }
    }
}

/// Polls a one-reply channel; clears `slot` once the reply (or hang-up) arrives.
fn take_reply<T>(slot: &mut Option<UnboundedReceiver<T>>) -> Poll<Option<T>> {
    let Some(rx) = slot.as_mut() else {
        return Poll::Pending;
    };
    let reply = match rx.try_recv() {
        Ok(value) => Some(value),
        Err(TryRecvError::Empty) => return Poll::Pending,
        Err(TryRecvError::Disconnected) => None,
    };
    *slot = None;
    Poll::Ready(reply)
}

/// GUI update loop: called each frame to redraw and handle interactions
impl App for MediaDownloaderApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        // 1️⃣ Apply results from background work
        self.poll_background(ctx);

        // 2️⃣ Form, progress and log
        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Media Downloader");

            ui.label("Enter URL:");
            ui.text_edit_singleline(&mut self.url_input);

            ui.horizontal(|ui| {
                ui.label("Select Format:");
                for format in [DownloadFormat::Audio, DownloadFormat::Video] {
                    ui.radio_value(&mut self.format, format, format.label());
                }
            });

            ui.horizontal(|ui| {
                ui.label("Save to:");
                ui.text_edit_singleline(&mut self.output_dir);
                if ui.button("Browse").clicked() {
                    if let Some(folder) = FileDialog::new().set_directory(&self.output_dir).pick_folder() {
                        self.output_dir = folder.display().to_string();
                    }
                }
            });

            ui.horizontal(|ui| {
                if ui.button("Download").clicked() {
                    self.start_download(ctx);
                }
                if ui.button("Cancel Download").clicked() {
                    self.cancel_download();
                }
                if ui.button("Fetch Info").clicked() {
                    self.fetch_info(ctx);
                }
            });

            ui.add(egui::ProgressBar::new(self.progress).show_percentage());

            if let Some(tex) = &self.thumbnail {
                ui.add(egui::Image::new(tex).max_height(120.0));
            }

            ui.separator();
            egui::ScrollArea::vertical()
                .auto_shrink([false; 2])
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for line in &self.log {
                        ui.label(line);
                    }
                });
        });

        // Request periodic repaint for progress updates
        ctx.request_repaint_after(std::time::Duration::from_millis(100));
    }
}
