//! Minimal HLS media playlist reader used to plan manifest-based segments.
//!
//! Only the tags needed for planning are interpreted. Variant selection is out of
//! scope, so master playlists are rejected and the caller falls back. So are
//! playlists whose segments need an `#EXT-X-MAP` initialization section, since a
//! cached segment is handed out on its own.

use crate::utils::locator::resolve_relative;
use crate::utils::{StreamError, StreamResult};

/// One media segment listed by a playlist
#[derive(Debug, Clone, PartialEq)]
pub struct PlaylistSegment {
    pub uri: String,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub target_duration: Option<f64>,
    pub segments: Vec<PlaylistSegment>,
}

impl MediaPlaylist {
    /// Nominal per-segment duration, as advertised by the playlist
    pub fn nominal_segment_duration(&self) -> Option<f64> {
        if let Some(target) = self.target_duration.filter(|d| *d > 0.0) {
            return Some(target);
        }
        self.segments
            .iter()
            .map(|s| s.duration)
            .filter(|d| d.is_finite() && *d > 0.0)
            .reduce(f64::max)
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Start time of every segment, followed by the end of the last one
    pub fn segment_bounds(&self) -> Vec<f64> {
        let mut bounds = Vec::with_capacity(self.segments.len() + 1);
        let mut start = 0.0;
        bounds.push(start);
        for segment in &self.segments {
            start += segment.duration;
            bounds.push(start);
        }
        bounds
    }
}

/// Parse a media playlist fetched from `base`, resolving segment URIs against it
pub fn parse_media_playlist(base: &str, text: &str) -> StreamResult<MediaPlaylist> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    if lines.next() != Some("#EXTM3U") {
        return Err(StreamError::Manifest(format!(
            "{} does not start with #EXTM3U",
            base
        )));
    }

    let mut target_duration = None;
    let mut pending_duration: Option<f64> = None;
    let mut segments = Vec::new();

    for line in lines {
        if line.starts_with("#EXT-X-STREAM-INF") {
            return Err(StreamError::Manifest(format!(
                "{} is a master playlist",
                base
            )));
        } else if line.starts_with("#EXT-X-MAP") {
            return Err(StreamError::Manifest(format!(
                "{} needs an initialization section",
                base
            )));
        } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = value.trim().parse::<f64>().ok();
        } else if let Some(value) = line.strip_prefix("#EXTINF:") {
            let duration = value.split(',').next().unwrap_or_default().trim();
            let duration = duration
                .parse::<f64>()
                .ok()
                .filter(|d| d.is_finite() && *d >= 0.0)
                .ok_or_else(|| {
                    StreamError::Manifest(format!("Bad #EXTINF duration '{}'", duration))
                })?;
            pending_duration = Some(duration);
        } else if line.starts_with('#') {
            continue;
        } else {
            let Some(duration) = pending_duration.take() else {
                return Err(StreamError::Manifest(format!(
                    "Segment '{}' has no #EXTINF",
                    line
                )));
            };
            let uri = resolve_relative(base, line).ok_or_else(|| {
                StreamError::InvalidLocator(format!("{} relative to {}", line, base))
            })?;
            segments.push(PlaylistSegment { uri, duration });
        }
    }

    if segments.is_empty() {
        return Err(StreamError::Manifest(format!("{} lists no segments", base)));
    }

    Ok(MediaPlaylist {
        target_duration,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://cdn.test/hls/clip/index.m3u8";

    #[test]
    fn test_parses_media_playlist() {
        let text = "#EXTM3U\n\
                    #EXT-X-VERSION:3\n\
                    #EXT-X-TARGETDURATION:4\n\
                    #EXT-X-MEDIA-SEQUENCE:0\n\
                    #EXTINF:4.0,\n\
                    seg0.ts\n\
                    #EXTINF:4.0,\n\
                    /abs/seg1.ts\n\
                    #EXTINF:2.5,tail\n\
                    https://edge.test/seg2.ts\n\
                    #EXT-X-ENDLIST\n";

        let playlist = parse_media_playlist(BASE, text).unwrap();
        assert_eq!(playlist.segments.len(), 3);
        assert_eq!(playlist.segments[0].uri, "https://cdn.test/hls/clip/seg0.ts");
        assert_eq!(playlist.segments[1].uri, "https://cdn.test/abs/seg1.ts");
        assert_eq!(playlist.segments[2].uri, "https://edge.test/seg2.ts");
        assert_eq!(playlist.nominal_segment_duration(), Some(4.0));
        assert!((playlist.total_duration() - 10.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_nominal_duration_without_target() {
        let text = "#EXTM3U\n#EXTINF:2.0,\na.ts\n#EXTINF:3.5,\nb.ts\n";
        let playlist = parse_media_playlist(BASE, text).unwrap();
        assert_eq!(playlist.target_duration, None);
        assert_eq!(playlist.nominal_segment_duration(), Some(3.5));
    }

    #[test]
    fn test_segment_bounds_follow_listed_durations() {
        let text = "#EXTM3U\n#EXT-X-TARGETDURATION:6\n\
                    #EXTINF:5.005,\na.ts\n#EXTINF:5.005,\nb.ts\n#EXTINF:2.0,\nc.ts\n";
        let playlist = parse_media_playlist(BASE, text).unwrap();

        let bounds = playlist.segment_bounds();
        assert_eq!(bounds.len(), 4);
        assert_eq!(bounds[0], 0.0);
        assert!((bounds[2] - 10.01).abs() < 1e-9);
        assert!((bounds[3] - playlist.total_duration()).abs() < 1e-9);
        assert_eq!(playlist.nominal_segment_duration(), Some(6.0));
    }

    #[test]
    fn test_rejects_initialization_sections() {
        let text = "#EXTM3U\n\
                    #EXT-X-TARGETDURATION:4\n\
                    #EXT-X-MAP:URI=\"init.mp4\"\n\
                    #EXTINF:4.0,\n\
                    seg0.m4s\n";
        assert!(matches!(
            parse_media_playlist(BASE, text),
            Err(StreamError::Manifest(_))
        ));
    }

    #[test]
    fn test_rejects_master_playlist() {
        let text = "#EXTM3U\n\
                    #EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
                    low/index.m3u8\n";
        assert!(matches!(
            parse_media_playlist(BASE, text),
            Err(StreamError::Manifest(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_playlists() {
        assert!(parse_media_playlist(BASE, "").is_err());
        assert!(parse_media_playlist(BASE, "<html>nope</html>").is_err());
        assert!(parse_media_playlist(BASE, "#EXTM3U\n#EXT-X-ENDLIST\n").is_err());
        assert!(parse_media_playlist(BASE, "#EXTM3U\nseg0.ts\n").is_err());
        assert!(parse_media_playlist(BASE, "#EXTM3U\n#EXTINF:abc,\nseg0.ts\n").is_err());
    }
}
