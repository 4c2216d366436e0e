//! Helpers for reasoning about resource locators without touching the network.

use url::Url;

const MANIFEST_EXTENSIONS: &[&str] = &["m3u8", "mpd"];

/// Lower-cased extension of the locator's last path segment, if any
pub fn extension(reference: &str) -> Option<String> {
    let path = match Url::parse(reference) {
        Ok(url) => url.path().to_string(),
        // Relative or opaque locators: strip query and fragment by hand
        Err(_) => reference
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let file = path.rsplit('/').next()?;
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// True when the locator itself names a manifest-based segmented format
pub fn is_manifest_locator(reference: &str) -> bool {
    extension(reference)
        .map(|ext| MANIFEST_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// True for HLS playlists, the only manifest flavour we can plan from
pub fn is_hls_locator(reference: &str) -> bool {
    extension(reference).as_deref() == Some("m3u8")
}

/// Predicted locator of a per-file segment.
///
/// `https://cdn/v/clip.mp4?sig=1` becomes `https://cdn/v/clip_seg3.mp4?sig=1` for
/// index 3. Returns `None` when the locator has no file name to derive from.
pub fn segment_locator(original: &str, index: usize) -> Option<String> {
    let mut url = Url::parse(original).ok()?;
    if url.cannot_be_a_base() {
        return None;
    }

    let path = url.path().to_string();
    let (dir, file) = path.rsplit_once('/')?;
    if file.is_empty() {
        return None;
    }

    let segment_file = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}_seg{}.{}", stem, index, ext),
        _ => format!("{}_seg{}", file, index),
    };

    url.set_path(&format!("{}/{}", dir, segment_file));
    Some(url.to_string())
}

/// Resolve a possibly relative reference against the locator it was found in
pub fn resolve_relative(base: &str, reference: &str) -> Option<String> {
    if let Ok(absolute) = Url::parse(reference) {
        return Some(absolute.to_string());
    }
    let base = Url::parse(base).ok()?;
    base.join(reference).ok().map(|u| u.to_string())
}

/// Media type used when a payload is embedded as a data reference
pub fn mime_for(reference: &str) -> &'static str {
    match extension(reference).as_deref() {
        Some("ts") => "video/mp2t",
        Some("m4s") => "video/iso.segment",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("m4v") => "video/x-m4v",
        Some("aac") => "audio/aac",
        _ => "video/mp4",
    }
}
