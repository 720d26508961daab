// =============================================================================
// LINE CLASSIFIER
// =============================================================================
//
// Turns one line of player output into at most one thing the controller cares
// about. Answers carry no request id, so each query we send opens an
// expectation slot and the first matching answer closes it; answers that
// arrive with no slot open are treated as unsolicited chatter.
//
// =============================================================================

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::core::MediaInfo;
use crate::slave::command::Query;
use crate::slave::position::PositionCandidate;
use crate::slave::state::ControllerState;

/// A value for one `MediaInfo` field.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaAssignment {
    VideoFormat(String),
    VideoBitrate(u32),
    Width(u32),
    Height(u32),
    DisplayAspect(f64),
    FrameRate(f64),
    AudioFormat(String),
    AudioBitrate(u32),
    SampleRate(u32),
    Channels(u32),
    Length(f64),
    Seekable(bool),
    AudioTrack(u32),
    AudioLanguage(u32, String),
    SubtitleTrack(u32),
    SubtitleLanguage(u32, String),
    TagName(u32, String),
    TagValue(u32, String),
    /// Streams are being identified again after a format switch
    Reidentify,
}

impl MediaAssignment {
    pub fn apply(self, info: &mut MediaInfo) {
        match self {
            MediaAssignment::VideoFormat(v) => info.set_video_format(&v),
            MediaAssignment::VideoBitrate(v) => info.set_video_bitrate(v),
            MediaAssignment::Width(v) => info.set_width(v),
            MediaAssignment::Height(v) => info.set_height(v),
            MediaAssignment::DisplayAspect(v) => info.set_display_aspect(v),
            MediaAssignment::FrameRate(v) => info.set_frame_rate(v),
            MediaAssignment::AudioFormat(v) => info.set_audio_format(&v),
            MediaAssignment::AudioBitrate(v) => info.set_audio_bitrate(v),
            MediaAssignment::SampleRate(v) => info.set_sample_rate(v),
            MediaAssignment::Channels(v) => info.set_channels(v),
            MediaAssignment::Length(v) => info.set_length(v),
            MediaAssignment::Seekable(v) => info.set_seekable(v),
            MediaAssignment::AudioTrack(id) => info.add_audio_track(id),
            MediaAssignment::AudioLanguage(id, lang) => info.set_audio_language(id, &lang),
            MediaAssignment::SubtitleTrack(id) => info.add_subtitle_track(id),
            MediaAssignment::SubtitleLanguage(id, lang) => info.set_subtitle_language(id, &lang),
            MediaAssignment::TagName(i, name) => info.set_pending_tag_name(i, &name),
            MediaAssignment::TagValue(i, value) => info.set_pending_tag_value(i, &value),
            MediaAssignment::Reidentify => {
                if info.is_finalized() {
                    info.unfinalize();
                }
            }
        }
    }
}

/// Confirmation of a speculative local change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackReport {
    Audio(Option<u32>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Ignored,
    StateHint(ControllerState),
    Position(PositionCandidate),
    Media(MediaAssignment),
    /// Identification finished: finalize `MediaInfo` and start playing
    MetadataComplete,
    Speed(f64),
    Error(String),
    Track(TrackReport),
}

// =============================================================================
// EXPECTATIONS
// =============================================================================

/// One in-flight slot per query kind.
#[derive(Debug, Default)]
pub struct Expectations {
    pending: HashSet<Query>,
}

impl Expectations {
    pub fn expect(&mut self, query: Query) {
        self.pending.insert(query);
    }

    /// Closes the slot for `query`; true if one was open.
    pub fn fulfil(&mut self, query: Query) -> bool {
        self.pending.remove(&query)
    }

    pub fn is_pending(&self, query: Query) -> bool {
        self.pending.contains(&query)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// =============================================================================
// CLASSIFIER
// =============================================================================

struct StatusPatterns {
    audio: Regex,
    video: Regex,
    desync: Regex,
}

fn status_patterns() -> &'static StatusPatterns {
    static PATTERNS: OnceLock<StatusPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| StatusPatterns {
        audio: Regex::new(r"(?:^|\s)A:\s*(-?\d+(?:\.\d+)?)").expect("valid audio clock pattern"),
        video: Regex::new(r"(?:^|\s)V:\s*(-?\d+(?:\.\d+)?)").expect("valid video clock pattern"),
        desync: Regex::new(r"A-V:\s*(-?\d+(?:\.\d+)?)").expect("valid desync pattern"),
    })
}

const FATAL_MARKERS: &[&str] = &[
    "File not found:",
    "Failed to open",
    "Error opening/initializing the selected video_out",
    "Could not open/initialize audio device",
];

#[derive(Debug, Default)]
pub struct LineClassifier {
    expectations: Expectations,
    identified: bool,
}

impl LineClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything about the previous source.
    pub fn reset(&mut self) {
        self.expectations.clear();
        self.identified = false;
    }

    pub fn expectations(&self) -> &Expectations {
        &self.expectations
    }

    pub fn expect(&mut self, query: Query) {
        self.expectations.expect(query);
    }

    pub fn clear_expectations(&mut self) {
        self.expectations.clear();
    }

    pub fn classify(&mut self, line: &str, state: &ControllerState) -> Classification {
        let line = line.trim();

        if line.starts_with("A:") || line.starts_with("V:") {
            return self.classify_status(line);
        }
        if let Some(rest) = line.strip_prefix("ANS_") {
            return self.classify_answer(rest, state);
        }
        if let Some(id_line) = strip_module_tag(line).strip_prefix("ID_") {
            return self.classify_identification(id_line, line, state);
        }
        if line.starts_with("Starting playback...") {
            if self.identified {
                return Classification::Ignored;
            }
            self.identified = true;
            return Classification::MetadataComplete;
        }
        if line.starts_with("Exiting...") || line.starts_with("EOF code:") {
            return Classification::StateHint(ControllerState::Stopped);
        }
        if line.contains("=====  PAUSE  =====") {
            return pause_report(true, state);
        }
        if line.starts_with("Cache fill:") || line.starts_with("Cache empty") {
            return Classification::StateHint(ControllerState::Buffering);
        }
        if FATAL_MARKERS.iter().any(|m| line.contains(m)) {
            return Classification::Error(line.to_string());
        }
        Classification::Ignored
    }

    fn classify_status(&self, line: &str) -> Classification {
        let patterns = status_patterns();
        let capture = |re: &Regex| -> Option<f64> {
            re.captures(line)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        };

        let markers: Vec<f64> = [capture(&patterns.audio), capture(&patterns.video)]
            .into_iter()
            .flatten()
            .collect();
        if markers.is_empty() {
            return Classification::Ignored;
        }
        if markers.iter().any(|m| *m < 0.0) {
            log::debug!("Negative clock in status line, ignoring: {}", line);
            return Classification::Ignored;
        }
        Classification::Position(PositionCandidate::status(markers, capture(&patterns.desync)))
    }

    fn classify_answer(&mut self, answer: &str, state: &ControllerState) -> Classification {
        let Some((name, value)) = answer.split_once('=') else {
            return Classification::Ignored;
        };
        let value = value.trim();
        match name {
            "TIME_POSITION" | "time_pos" => {
                let explicit = self.expectations.fulfil(Query::Position);
                match parse_finite(value) {
                    Some(v) if v >= 0.0 => Classification::Position(PositionCandidate::answer(v, explicit)),
                    _ => {
                        log::debug!("Unusable position answer: {}", value);
                        Classification::Ignored
                    }
                }
            }
            "pause" => {
                if !self.expectations.fulfil(Query::Pause) {
                    log::debug!("Unsolicited pause answer, ignoring");
                    return Classification::Ignored;
                }
                match value {
                    "yes" => pause_report(true, state),
                    "no" => pause_report(false, state),
                    _ => Classification::Ignored,
                }
            }
            "speed" => {
                self.expectations.fulfil(Query::Speed);
                match parse_finite(value) {
                    Some(v) if v > 0.0 => Classification::Speed(v),
                    _ => Classification::Ignored,
                }
            }
            "switch_audio" => {
                self.expectations.fulfil(Query::AudioTrack);
                match value.parse::<i64>() {
                    Ok(id) if id >= 0 => Classification::Track(TrackReport::Audio(Some(id as u32))),
                    Ok(_) => Classification::Track(TrackReport::Audio(None)),
                    Err(_) => Classification::Ignored,
                }
            }
            "ERROR" => {
                // We cannot tell which query failed
                log::debug!("Player rejected a query: {}", value);
                self.expectations.clear();
                Classification::Ignored
            }
            _ => Classification::Ignored,
        }
    }

    fn classify_identification(&mut self, id_line: &str, line: &str, state: &ControllerState) -> Classification {
        let (key, value) = match id_line.split_once('=') {
            Some((key, value)) => (key, value.trim()),
            None => (id_line, ""),
        };

        match key {
            "EXIT" => return Classification::StateHint(ControllerState::Stopped),
            "SIGNAL" => return Classification::Error(line.to_string()),
            "PAUSED" => return pause_report(true, state),
            "VIDEO_CODEC" | "AUDIO_CODEC" => {
                if self.identified {
                    self.identified = false;
                    return Classification::Media(MediaAssignment::Reidentify);
                }
                return Classification::Ignored;
            }
            _ => {}
        }

        if self.identified {
            log::debug!("Identification after finalization, dropping: {}", line);
            return Classification::Ignored;
        }

        match parse_assignment(key, value) {
            Some(assignment) => Classification::Media(assignment),
            None => {
                log::debug!("Unhandled identification line: {}", line);
                Classification::Ignored
            }
        }
    }
}

fn pause_report(paused: bool, state: &ControllerState) -> Classification {
    match (paused, state) {
        // Already there
        (true, ControllerState::Paused) | (false, ControllerState::Playing) => Classification::Ignored,
        // Answer to a query sent before we resumed
        (true, ControllerState::Playing) => Classification::Ignored,
        (true, ControllerState::Loading | ControllerState::Buffering) => {
            Classification::StateHint(ControllerState::Paused)
        }
        (false, ControllerState::Paused | ControllerState::Loading | ControllerState::Buffering) => {
            Classification::StateHint(ControllerState::Playing)
        }
        _ => Classification::Ignored,
    }
}

/// Drops a leading `[module]` tag.
fn strip_module_tag(line: &str) -> &str {
    if line.starts_with('[') {
        if let Some(end) = line.find(']') {
            return line[end + 1..].trim_start();
        }
    }
    line
}

/// `inf` and `nan` parse as floats but are never usable player values.
fn parse_finite(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Track number in keys such as `AID_2_LANG`.
fn track_key(key: &str, prefix: &str, suffix: &str) -> Option<u32> {
    key.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

fn parse_assignment(key: &str, value: &str) -> Option<MediaAssignment> {
    let assignment = match key {
        "VIDEO_FORMAT" => MediaAssignment::VideoFormat(value.to_string()),
        "VIDEO_BITRATE" => MediaAssignment::VideoBitrate(value.parse().ok()?),
        "VIDEO_WIDTH" => MediaAssignment::Width(value.parse().ok()?),
        "VIDEO_HEIGHT" => MediaAssignment::Height(value.parse().ok()?),
        "VIDEO_ASPECT" => MediaAssignment::DisplayAspect(parse_finite(value)?),
        "VIDEO_FPS" => MediaAssignment::FrameRate(parse_finite(value)?),
        "AUDIO_FORMAT" => MediaAssignment::AudioFormat(value.to_string()),
        "AUDIO_BITRATE" => MediaAssignment::AudioBitrate(value.parse().ok()?),
        "AUDIO_RATE" => MediaAssignment::SampleRate(value.parse().ok()?),
        "AUDIO_NCH" => MediaAssignment::Channels(value.parse().ok()?),
        "LENGTH" => MediaAssignment::Length(parse_finite(value).filter(|v| *v >= 0.0)?),
        "SEEKABLE" => MediaAssignment::Seekable(value == "1"),
        "AUDIO_ID" => MediaAssignment::AudioTrack(value.parse().ok()?),
        "SUBTITLE_ID" => MediaAssignment::SubtitleTrack(value.parse().ok()?),
        _ => {
            if let Some(id) = track_key(key, "AID_", "_LANG") {
                MediaAssignment::AudioLanguage(id, value.to_string())
            } else if let Some(id) = track_key(key, "SID_", "_LANG") {
                MediaAssignment::SubtitleLanguage(id, value.to_string())
            } else if let Some(index) = key.strip_prefix("CLIP_INFO_NAME").and_then(|i| i.parse().ok()) {
                MediaAssignment::TagName(index, value.to_string())
            } else if let Some(index) = key.strip_prefix("CLIP_INFO_VALUE").and_then(|i| i.parse().ok()) {
                MediaAssignment::TagValue(index, value.to_string())
            } else {
                return None;
            }
        }
    };
    Some(assignment)
}

// =============================================================================
// BATCH REDUCTION
// =============================================================================

/// Everything classified from one read event, reduced to one decision of
/// each kind.
#[derive(Debug, Default)]
pub struct Batch {
    pub media: Vec<MediaAssignment>,
    pub metadata_complete: bool,
    pub state_hint: Option<ControllerState>,
    pub position: Option<PositionCandidate>,
    pub errors: Vec<String>,
    pub speed: Option<f64>,
    pub tracks: Vec<TrackReport>,
}

impl Batch {
    pub fn absorb(&mut self, classification: Classification) {
        match classification {
            Classification::Ignored => {}
            Classification::StateHint(state) => self.state_hint = Some(state),
            Classification::Position(candidate) => {
                // A later status line does not override an answer we asked for
                let keep_explicit = self.position.as_ref().is_some_and(|p| p.explicit) && !candidate.explicit;
                if !keep_explicit {
                    self.position = Some(candidate);
                }
            }
            Classification::Media(assignment) => self.media.push(assignment),
            Classification::MetadataComplete => {
                self.metadata_complete = true;
                self.state_hint = Some(ControllerState::Playing);
            }
            Classification::Speed(speed) => self.speed = Some(speed),
            Classification::Error(reason) => self.errors.push(reason),
            Classification::Track(report) => self.tracks.push(report),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_empty()
            && !self.metadata_complete
            && self.state_hint.is_none()
            && self.position.is_none()
            && self.errors.is_empty()
            && self.speed.is_none()
            && self.tracks.is_empty()
    }

    pub fn error_reason(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }
}
