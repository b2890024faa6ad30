use eframe::egui::ColorImage;
use tracing::debug;

/// Downloads and decodes the thumbnail advertised by yt-dlp's info dump.
pub fn fetch_thumbnail(url: &str) -> Option<ColorImage> {
    // Perform a blocking HTTP GET request, returning None on any error
    let resp = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.bytes())
        .map_err(|e| debug!(url, "thumbnail fetch failed: {e}"))
        .ok()?;
    decode_thumbnail(&resp)
}

fn decode_thumbnail(bytes: &[u8]) -> Option<ColorImage> {
    // Load image data into an image::DynamicImage and convert to RGBA8
    let img = image::load_from_memory(bytes).ok()?.to_rgba8();
    let size = [img.width() as usize, img.height() as usize];
    Some(ColorImage::from_rgba_unmultiplied(size, &img))
}
