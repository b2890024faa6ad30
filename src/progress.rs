/// Marker yt-dlp prints in front of each progress line we ask it for.
pub const PROGRESS_PREFIX: &str = "mdl-progress:";

/// `--progress-template` value: status, downloaded, total, estimated total.
pub fn progress_template() -> String {
    format!(
        "download:{PROGRESS_PREFIX}%(progress.status)s:%(progress.downloaded_bytes)s:\
         %(progress.total_bytes)s:%(progress.total_bytes_estimate)s"
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStatus {
    Downloading,
    Finished,
    Other,
}

/// One progress checkpoint reported by the extractor
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    pub status: ProgressStatus,
    pub downloaded_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
    pub total_bytes_estimate: Option<f64>,
}

impl ProgressUpdate {
    #[cfg(test)]
    pub fn downloading(downloaded: u64, total: Option<u64>) -> Self {
        Self {
            status: ProgressStatus::Downloading,
            downloaded_bytes: Some(downloaded),
            total_bytes: total,
            total_bytes_estimate: None,
        }
    }

    /// Percentage of the transfer done, or `None` while the total is unknown.
    ///
    /// The exact total wins over the estimate. Only active transfers report.
    pub fn percentage(&self) -> Option<f32> {
        if self.status != ProgressStatus::Downloading {
            return None;
        }
        let downloaded = self.downloaded_bytes? as f64;
        let total = self
            .total_bytes
            .filter(|t| *t > 0)
            .map(|t| t as f64)
            .or(self.total_bytes_estimate.filter(|t| *t > 0.0))?;
        Some((downloaded / total * 100.0) as f32)
    }
}

/// Parses a line produced by [`progress_template`].
pub fn parse_progress_from_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let mut fields = rest.split(':');
    let status = match fields.next()?.trim() {
        "downloading" => ProgressStatus::Downloading,
        "finished" => ProgressStatus::Finished,
        _ => ProgressStatus::Other,
    };
    let downloaded_bytes = fields.next().and_then(parse_number).map(|v| v as u64);
    let total_bytes = fields.next().and_then(parse_number).map(|v| v as u64);
    let total_bytes_estimate = fields.next().and_then(parse_number);
    Some(ProgressUpdate {
        status,
        downloaded_bytes,
        total_bytes,
        total_bytes_estimate,
    })
}

// yt-dlp prints "NA" for missing fields
fn parse_number(field: &str) -> Option<f64> {
    field.trim().parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}
