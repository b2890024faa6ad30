//! Application settings.
//!
//! Everything has a built-in default; a few environment variables override
//! the defaults so the tools directory and archive source can be pointed
//! elsewhere without rebuilding.

use std::path::PathBuf;

use crate::bootstrap::{BootstrapConfig, FFMPEG_ARCHIVE_URL, ffmpeg_executable_name};

pub const TOOLS_DIR_VAR: &str = "MEDIA_DL_TOOLS_DIR";
pub const FFMPEG_URL_VAR: &str = "MEDIA_DL_FFMPEG_URL";
pub const YTDLP_VAR: &str = "MEDIA_DL_YTDLP";
pub const OUTPUT_DIR_VAR: &str = "MEDIA_DL_OUTPUT_DIR";

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Where ffmpeg (and optionally yt-dlp) live
    pub tools_dir: PathBuf,
    /// ZIP archive containing `bin/ffmpeg`; only Windows has a default
    pub ffmpeg_archive_url: Option<String>,
    /// Explicit yt-dlp program, bypassing the lookup
    pub ytdlp_program: Option<PathBuf>,
    /// Initial value of the "Save to" field
    pub output_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tools_dir: default_tools_dir(),
            ffmpeg_archive_url: cfg!(target_os = "windows").then(|| FFMPEG_ARCHIVE_URL.to_string()),
            ytdlp_program: None,
            output_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from defaults plus whatever `lookup` returns.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(dir) = value(TOOLS_DIR_VAR) {
            config.tools_dir = PathBuf::from(dir);
        }
        if let Some(url) = value(FFMPEG_URL_VAR) {
            config.ffmpeg_archive_url = Some(url);
        }
        if let Some(program) = value(YTDLP_VAR) {
            config.ytdlp_program = Some(PathBuf::from(program));
        }
        if let Some(dir) = value(OUTPUT_DIR_VAR) {
            config.output_dir = PathBuf::from(dir);
        }
        config
    }

    /// Elsewhere than Windows a system ffmpeg on `PATH` is accepted too.
    pub fn bootstrap(&self) -> BootstrapConfig {
        BootstrapConfig {
            tools_dir: self.tools_dir.clone(),
            archive_url: self.ffmpeg_archive_url.clone(),
            executable: ffmpeg_executable_name().to_string(),
            search_path: if cfg!(target_os = "windows") {
                None
            } else {
                std::env::var_os("PATH")
            },
        }
    }
}

/// `scripts/` next to the running executable.
fn default_tools_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("scripts")))
        .unwrap_or_else(|| PathBuf::from("scripts"))
}
