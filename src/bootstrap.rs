//! Makes sure ffmpeg is available in the tools directory.
//!
//! The tools directory is checked first, then the search path. Only when
//! neither has the binary is the release archive downloaded, its
//! `bin/ffmpeg` entry unpacked next to the application and the rest of the
//! archive dropped. Later calls find the file without touching the network.

use std::{
    ffi::OsString,
    fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::{error::BootstrapError, model::ExecutableLocation};

/// ffmpeg "essentials" release build; Windows binaries only
pub const FFMPEG_ARCHIVE_URL: &str =
    "https://www.gyan.dev/ffmpeg/builds/ffmpeg-release-essentials.zip";

pub fn ffmpeg_executable_name() -> &'static str {
    if cfg!(target_os = "windows") { "ffmpeg.exe" } else { "ffmpeg" }
}

#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub tools_dir: PathBuf,
    /// Archive to download from; `None` when no build exists for this platform
    pub archive_url: Option<String>,
    /// File name of the binary inside the archive and on disk
    pub executable: String,
    /// `PATH`-style list searched before downloading
    pub search_path: Option<OsString>,
}

impl BootstrapConfig {
    pub fn target_path(&self) -> PathBuf {
        self.tools_dir.join(&self.executable)
    }
}

/// Where the archive bytes come from.
pub trait ArchiveSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, BootstrapError>;
}

/// Single blocking GET, no retries.
pub struct HttpArchiveSource;

impl ArchiveSource for HttpArchiveSource {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, BootstrapError> {
        let fetch_error = |reason: String| BootstrapError::Fetch {
            url: url.to_string(),
            reason,
        };
        let response = reqwest::blocking::get(url).map_err(|e| fetch_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("status code {status}")));
        }
        let bytes = response.bytes().map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Returns the local executable, downloading and unpacking it if missing.
pub fn ensure_executable(
    config: &BootstrapConfig,
    source: &dyn ArchiveSource,
) -> Result<ExecutableLocation, BootstrapError> {
    let target = config.target_path();
    if target.is_file() {
        debug!(path = %target.display(), "executable already present");
        return Ok(ExecutableLocation::new(target));
    }

    if let Some(paths) = &config.search_path {
        if let Ok(found) = which::which_in(&config.executable, Some(paths), &config.tools_dir) {
            debug!(path = %found.display(), "executable found on search path");
            return Ok(ExecutableLocation::new(found));
        }
    }

    let Some(url) = &config.archive_url else {
        return Err(BootstrapError::Unavailable {
            executable: config.executable.clone(),
        });
    };

    fs::create_dir_all(&config.tools_dir).map_err(|e| extraction_error(&config.tools_dir, e))?;

    info!(url = %url, "downloading {}", config.executable);
    let bytes = source.fetch(url)?;

    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| extraction_error(&target, e.into()))?;
    let names = entry_names(&mut archive).map_err(|e| extraction_error(&target, e))?;
    let entry = find_binary_entry(names.iter().map(String::as_str), &config.executable)?;
    debug!(entry = %entry, "found executable in archive");
    let index = names.iter().position(|name| name == entry).ok_or_else(|| {
        BootstrapError::ArchiveLayout {
            executable: config.executable.clone(),
        }
    })?;

    extract_entry(&mut archive, index, &config.tools_dir, &target)?;
    info!(path = %target.display(), "{} installed", config.executable);
    Ok(ExecutableLocation::new(target))
}

/// First entry whose name ends with `executable` and sits under a `bin` directory.
///
/// Both `/` and `\` separators are accepted.
pub fn find_binary_entry<'a>(
    names: impl IntoIterator<Item = &'a str>,
    executable: &str,
) -> Result<&'a str, BootstrapError> {
    names
        .into_iter()
        .find(|name| {
            let normalized = name.replace('\\', "/");
            if !normalized.ends_with(executable) {
                return false;
            }
            let mut segments: Vec<&str> = normalized.split('/').collect();
            segments.pop();
            segments.contains(&"bin")
        })
        .ok_or_else(|| BootstrapError::ArchiveLayout {
            executable: executable.to_string(),
        })
}

/// Runs `<executable> -version` and returns the first line of its output.
pub fn verify_executable(location: &ExecutableLocation) -> Result<String, BootstrapError> {
    let check_error = |reason: String| BootstrapError::ExecutableCheck {
        path: location.path().to_path_buf(),
        reason,
    };
    let output = Command::new(location.path())
        .arg("-version")
        .output()
        .map_err(|e| check_error(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(check_error(format!(
            "{} {}",
            output.status,
            stderr.lines().last().unwrap_or_default()
        )));
    }
    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or_default()
        .to_string();
    debug!(version = %version, "executable check passed");
    Ok(version)
}

fn entry_names<R: io::Read + io::Seek>(archive: &mut ZipArchive<R>) -> io::Result<Vec<String>> {
    (0..archive.len())
        .map(|index| {
            archive
                .by_index(index)
                .map(|entry| entry.name().to_string())
                .map_err(io::Error::from)
        })
        .collect()
}

/// Relative path for an archive entry name, split on either separator.
///
/// `None` for names that would leave the extraction directory.
fn entry_path(name: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for segment in name.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s if s.contains(':') => return None,
            s => path.push(s),
        }
    }
    (!path.as_os_str().is_empty() && !name.starts_with(['/', '\\'])).then_some(path)
}

/// Unpacks entry `index` under `tools_dir`, moves it to `target` and drops
/// the extracted top-level directory.
fn extract_entry<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    index: usize,
    tools_dir: &Path,
    target: &Path,
) -> Result<(), BootstrapError> {
    let mut file = archive
        .by_index(index)
        .map_err(|e| extraction_error(target, e.into()))?;
    let relative = entry_path(file.name()).ok_or_else(|| BootstrapError::Extraction {
        path: PathBuf::from(file.name()),
        reason: "entry escapes the extraction directory".to_string(),
    })?;
    let extracted = tools_dir.join(&relative);

    if let Some(parent) = extracted.parent() {
        fs::create_dir_all(parent).map_err(|e| extraction_error(parent, e))?;
    }
    let mut output = fs::File::create(&extracted).map_err(|e| extraction_error(&extracted, e))?;
    io::copy(&mut file, &mut output).map_err(|e| extraction_error(&extracted, e))?;
    drop(output);

    fs::rename(&extracted, target).map_err(|e| extraction_error(target, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(0o755))
            .map_err(|e| extraction_error(target, e))?;
    }

    if let Some(top) = relative.iter().next() {
        let leftover = tools_dir.join(top);
        if leftover.is_dir() {
            if let Err(e) = fs::remove_dir_all(&leftover) {
                warn!(path = %leftover.display(), "failed to remove extracted folder: {e}");
            }
        }
    }
    Ok(())
}

fn extraction_error(path: &Path, error: io::Error) -> BootstrapError {
    BootstrapError::Extraction {
        path: path.to_path_buf(),
        reason: error.to_string(),
    }
}
