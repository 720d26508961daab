use std::collections::{BTreeMap, HashMap};

use crate::core::error::CropError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interlace {
    Interlaced,
    Progressive,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Track id <-> language code, in both directions.
///
/// The first id registered for a language keeps it. Language lookups only
/// answer once the owning `MediaInfo` has been finalized.
#[derive(Debug, Clone, Default)]
pub struct TrackLanguages {
    by_id: BTreeMap<u32, Option<String>>,
    by_language: HashMap<String, u32>,
}

impl TrackLanguages {
    fn add_track(&mut self, id: u32) {
        self.by_id.entry(id).or_insert(None);
    }

    fn set_language(&mut self, id: u32, language: &str) {
        let language = language.trim().to_lowercase();
        self.by_id.insert(id, Some(language.clone()));
        self.by_language.entry(language).or_insert(id);
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.by_id.keys().copied()
    }

    pub fn language_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).and_then(|l| l.as_deref())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Next id after `current`, wrapping around.
    pub fn next_after(&self, current: Option<u32>) -> Option<u32> {
        let first = self.by_id.keys().next().copied();
        match current {
            Some(current) => self
                .by_id
                .range(current + 1..)
                .next()
                .map(|(id, _)| *id)
                .or(first),
            None => first,
        }
    }
}

/// Identification data reported by the player for the loaded source.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    video_format: Option<String>,
    video_bitrate: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    display_aspect: Option<f64>,
    frame_rate: Option<f64>,

    audio_format: Option<String>,
    audio_bitrate: Option<u32>,
    sample_rate: Option<u32>,
    channels: Option<u32>,

    length: Option<f64>,
    seekable: bool,
    crop: Option<CropRect>,
    interlace: Interlace,
    tags: BTreeMap<String, String>,
    pending_tag_names: HashMap<u32, String>,

    audio_tracks: TrackLanguages,
    subtitle_tracks: TrackLanguages,

    finalized: bool,
}

impl MediaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self, what: &str) {
        assert!(
            !self.finalized,
            "MediaInfo is finalized; refusing to set {}",
            what
        );
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn finalize(&mut self) {
        self.finalized = true;
        self.pending_tag_names.clear();
    }

    /// Reopens the record when the player re-identifies its streams, e.g.
    /// after a format switch. Stream parameters are dropped; length, tags and
    /// track tables survive.
    pub fn unfinalize(&mut self) {
        self.finalized = false;
        self.video_format = None;
        self.video_bitrate = None;
        self.width = None;
        self.height = None;
        self.display_aspect = None;
        self.frame_rate = None;
        self.audio_format = None;
        self.audio_bitrate = None;
        self.sample_rate = None;
        self.channels = None;
    }

    // =============================================================================
    // SETTERS
    // =============================================================================

    pub fn set_video_format(&mut self, format: &str) {
        self.ensure_open("video format");
        self.video_format = Some(format.to_string());
    }

    pub fn set_video_bitrate(&mut self, bitrate: u32) {
        self.ensure_open("video bitrate");
        self.video_bitrate = Some(bitrate);
    }

    pub fn set_width(&mut self, width: u32) {
        self.ensure_open("width");
        self.width = Some(width);
    }

    pub fn set_height(&mut self, height: u32) {
        self.ensure_open("height");
        self.height = Some(height);
    }

    pub fn set_display_aspect(&mut self, aspect: f64) {
        self.ensure_open("display aspect");
        // The player reports 0 when the container carries no aspect
        self.display_aspect = if aspect > 0.0 { Some(aspect) } else { None };
    }

    pub fn set_frame_rate(&mut self, fps: f64) {
        self.ensure_open("frame rate");
        self.frame_rate = Some(fps);
    }

    pub fn set_audio_format(&mut self, format: &str) {
        self.ensure_open("audio format");
        self.audio_format = Some(format.to_string());
    }

    pub fn set_audio_bitrate(&mut self, bitrate: u32) {
        self.ensure_open("audio bitrate");
        self.audio_bitrate = Some(bitrate);
    }

    pub fn set_sample_rate(&mut self, rate: u32) {
        self.ensure_open("sample rate");
        self.sample_rate = Some(rate);
    }

    pub fn set_channels(&mut self, channels: u32) {
        self.ensure_open("channel count");
        self.channels = Some(channels);
    }

    pub fn set_length(&mut self, length: f64) {
        self.ensure_open("length");
        self.length = if length > 0.0 { Some(length) } else { None };
    }

    pub fn set_seekable(&mut self, seekable: bool) {
        self.ensure_open("seekable flag");
        self.seekable = seekable;
    }

    pub fn set_interlace(&mut self, interlace: Interlace) {
        self.ensure_open("interlace");
        self.interlace = interlace;
    }

    pub fn set_crop(&mut self, crop: CropRect) -> Result<(), CropError> {
        self.ensure_open("crop");
        if let (Some(width), Some(height)) = (self.width, self.height) {
            let fits = crop.x.checked_add(crop.w).is_some_and(|r| r <= width)
                && crop.y.checked_add(crop.h).is_some_and(|b| b <= height);
            if !fits {
                return Err(CropError::OutOfFrame {
                    x: crop.x,
                    y: crop.y,
                    w: crop.w,
                    h: crop.h,
                    width,
                    height,
                });
            }
        }
        self.crop = Some(crop);
        Ok(())
    }

    pub fn set_tag(&mut self, name: &str, value: &str) {
        self.ensure_open("tag");
        self.tags.insert(name.to_lowercase(), value.to_string());
    }

    /// `ID_CLIP_INFO_NAMEn` arrives before the matching `ID_CLIP_INFO_VALUEn`.
    pub fn set_pending_tag_name(&mut self, index: u32, name: &str) {
        self.ensure_open("tag name");
        self.pending_tag_names.insert(index, name.to_string());
    }

    pub fn set_pending_tag_value(&mut self, index: u32, value: &str) {
        self.ensure_open("tag value");
        match self.pending_tag_names.remove(&index) {
            Some(name) => self.set_tag(&name, value),
            None => log::debug!("Tag value {} without a name, dropping", index),
        }
    }

    pub fn add_audio_track(&mut self, id: u32) {
        self.ensure_open("audio track");
        self.audio_tracks.add_track(id);
    }

    pub fn set_audio_language(&mut self, id: u32, language: &str) {
        self.ensure_open("audio language");
        self.audio_tracks.set_language(id, language);
    }

    pub fn add_subtitle_track(&mut self, id: u32) {
        self.ensure_open("subtitle track");
        self.subtitle_tracks.add_track(id);
    }

    pub fn set_subtitle_language(&mut self, id: u32, language: &str) {
        self.ensure_open("subtitle language");
        self.subtitle_tracks.set_language(id, language);
    }

    // =============================================================================
    // QUERIES
    // =============================================================================

    pub fn video_format(&self) -> Option<&str> {
        self.video_format.as_deref()
    }

    pub fn video_bitrate(&self) -> Option<u32> {
        self.video_bitrate
    }

    pub fn width(&self) -> Option<u32> {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    pub fn display_aspect(&self) -> Option<f64> {
        self.display_aspect
            .or_else(|| match (self.width, self.height) {
                (Some(w), Some(h)) if h > 0 => Some(w as f64 / h as f64),
                _ => None,
            })
    }

    /// Pixel aspect ratio derived from the display aspect and frame size.
    pub fn pixel_aspect(&self) -> Option<f64> {
        match (self.display_aspect, self.width, self.height) {
            (Some(dar), Some(w), Some(h)) if w > 0 && h > 0 => Some(dar * h as f64 / w as f64),
            (None, Some(_), Some(_)) => Some(1.0),
            _ => None,
        }
    }

    pub fn frame_rate(&self) -> Option<f64> {
        self.frame_rate
    }

    pub fn audio_format(&self) -> Option<&str> {
        self.audio_format.as_deref()
    }

    pub fn audio_bitrate(&self) -> Option<u32> {
        self.audio_bitrate
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn channels(&self) -> Option<u32> {
        self.channels
    }

    pub fn length(&self) -> Option<f64> {
        self.length
    }

    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    pub fn crop(&self) -> Option<CropRect> {
        self.crop
    }

    pub fn interlace(&self) -> Interlace {
        self.interlace
    }

    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn has_video(&self) -> bool {
        self.video_format.is_some() || self.width.is_some()
    }

    pub fn audio_tracks(&self) -> &TrackLanguages {
        &self.audio_tracks
    }

    pub fn subtitle_tracks(&self) -> &TrackLanguages {
        &self.subtitle_tracks
    }

    pub fn audio_track_for_language(&self, language: &str) -> Option<u32> {
        if !self.finalized {
            return None;
        }
        self.audio_tracks.by_language.get(&language.to_lowercase()).copied()
    }

    pub fn subtitle_track_for_language(&self, language: &str) -> Option<u32> {
        if !self.finalized {
            return None;
        }
        self.subtitle_tracks.by_language.get(&language.to_lowercase()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_id_wins_language_collision() {
        let mut info = MediaInfo::new();
        info.set_audio_language(2, "eng");
        info.set_audio_language(1, "eng");
        info.set_audio_language(3, "jpn");

        // Reverse lookup is undefined before finalization
        assert_eq!(info.audio_track_for_language("eng"), None);

        info.finalize();
        assert_eq!(info.audio_track_for_language("eng"), Some(2));
        assert_eq!(info.audio_track_for_language("JPN"), Some(3));
        assert_eq!(info.audio_tracks().language_of(1), Some("eng"));
    }

    #[test]
    #[should_panic(expected = "finalized")]
    fn test_write_after_finalize_panics() {
        let mut info = MediaInfo::new();
        info.set_length(120.0);
        info.finalize();
        info.set_length(10.0);
    }

    #[test]
    fn test_unfinalize_allows_reidentification() {
        let mut info = MediaInfo::new();
        info.set_length(120.0);
        info.set_audio_format("mp3");
        info.finalize();

        info.unfinalize();
        info.set_audio_format("aac");
        info.finalize();

        assert_eq!(info.audio_format(), Some("aac"));
        assert_eq!(info.length(), Some(120.0));
    }

    #[test]
    fn test_crop_must_fit_frame() {
        let mut info = MediaInfo::new();
        info.set_width(1920);
        info.set_height(1080);

        assert!(info.set_crop(CropRect { x: 0, y: 140, w: 1920, h: 800 }).is_ok());
        assert!(info.set_crop(CropRect { x: 10, y: 0, w: 1920, h: 800 }).is_err());
        assert_eq!(info.crop(), Some(CropRect { x: 0, y: 140, w: 1920, h: 800 }));
    }

    #[test]
    fn test_pixel_aspect_from_display_aspect() {
        let mut info = MediaInfo::new();
        info.set_width(720);
        info.set_height(576);
        info.set_display_aspect(16.0 / 9.0);

        let par = info.pixel_aspect().unwrap();
        assert!((par - 1.4222).abs() < 0.001);
    }

    #[test]
    fn test_tags_pair_names_with_values() {
        let mut info = MediaInfo::new();
        info.set_pending_tag_name(0, "Title");
        info.set_pending_tag_value(0, "Big Buck Bunny");
        info.set_pending_tag_value(1, "orphan");

        assert_eq!(info.tag("title"), Some("Big Buck Bunny"));
        assert_eq!(info.tags().len(), 1);
    }

    #[test]
    fn test_next_track_wraps() {
        let mut info = MediaInfo::new();
        info.add_audio_track(1);
        info.add_audio_track(3);

        assert_eq!(info.audio_tracks().next_after(None), Some(1));
        assert_eq!(info.audio_tracks().next_after(Some(1)), Some(3));
        assert_eq!(info.audio_tracks().next_after(Some(3)), Some(1));
    }
}
