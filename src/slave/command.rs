// =============================================================================
// COMMAND QUEUE AND WRITE THROTTLING
// =============================================================================
//
// The player reads its stdin one line at a time and never acknowledges a
// command. Writing faster than it answers only makes its replies harder to
// pair with what we asked, so outgoing commands wait in a queue and a
// throttle decides when the head may go out.
//
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::ControllerConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekMode {
    /// Offset is added to the expected position at send time
    Relative,
    /// Offset is a percentage of the media length
    Percentage,
    Absolute,
}

/// Properties we ask the player about and expect an `ANS_` line for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    Position,
    Pause,
    Speed,
    AudioTrack,
}

impl Query {
    pub fn literal(self) -> &'static str {
        match self {
            Query::Position => "pausing_keep_force get_time_pos",
            Query::Pause => "pausing_keep_force get_property pause",
            Query::Speed => "pausing_keep_force get_property speed",
            Query::AudioTrack => "pausing_keep_force get_property switch_audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Text(String),
    Query(Query),
    /// Target is computed against the tracked position when the command is sent
    Seek { offset: f64, mode: SeekMode },
    /// Shows the tracked position as it is when the command is sent
    OsdLocation { duration_ms: u32 },
    /// Holds back everything behind it until this long after the last write
    Delay(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    created_at: Instant,
}

impl Command {
    pub fn new(kind: CommandKind, created_at: Instant) -> Self {
        Self { kind, created_at }
    }

    pub fn text(text: impl Into<String>, created_at: Instant) -> Self {
        Self::new(CommandKind::Text(text.into()), created_at)
    }

    pub fn query(query: Query, created_at: Instant) -> Self {
        Self::new(CommandKind::Query(query), created_at)
    }

    pub fn seek(offset: f64, mode: SeekMode, created_at: Instant) -> Self {
        Self::new(CommandKind::Seek { offset, mode }, created_at)
    }

    pub fn delay(delay: Duration, created_at: Instant) -> Self {
        Self::new(CommandKind::Delay(delay), created_at)
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_delay(&self) -> bool {
        matches!(self.kind, CommandKind::Delay(_))
    }
}

// =============================================================================
// LITERALS
// =============================================================================

pub const PAUSE_TOGGLE: &str = "pause";
pub const STOP: &str = "stop";
pub const QUIT: &str = "quit";
pub const NEXT_ITEM: &str = "pt_step 1";

pub fn seek_literal(target: f64) -> String {
    format!("pausing_keep seek {} 2", target.round() as i64)
}

pub fn loadfile_literal(source: &str) -> String {
    format!("loadfile {} 0", quote(source))
}

pub fn mute_literal(muted: bool) -> String {
    format!("pausing_keep_force set_property mute {}", muted as u8)
}

pub fn speed_literal(speed: f64) -> String {
    format!("pausing_keep_force set_property speed {:.2}", speed)
}

pub fn deinterlace_literal(enabled: bool) -> String {
    format!("pausing_keep_force set_property deinterlace {}", enabled as u8)
}

pub fn audio_track_literal(id: Option<u32>) -> String {
    match id {
        Some(id) => format!("pausing_keep_force set_property switch_audio {}", id),
        None => "pausing_keep_force switch_audio".to_string(),
    }
}

pub fn subtitle_track_literal(id: Option<u32>) -> String {
    let value = id.map(|id| id as i64).unwrap_or(-1);
    format!("pausing_keep_force set_property switch_subtitle {}", value)
}

pub fn osd_literal(text: &str, duration_ms: u32) -> String {
    format!("pausing_keep_force osd_show_text {} {} 0", quote(text), duration_ms)
}

/// Renders seconds as `H:MM:SS`.
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

// =============================================================================
// I/O CLOCK
// =============================================================================

/// When we last heard from the player and when we last wrote to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoClock {
    last_read: Option<Instant>,
    last_write: Option<Instant>,
}

impl IoClock {
    pub fn note_read(&mut self, at: Instant) {
        self.last_read = Some(at);
    }

    pub fn note_write(&mut self, at: Instant) {
        self.last_write = Some(at);
    }

    pub fn last_read(&self) -> Option<Instant> {
        self.last_read
    }

    pub fn last_write(&self) -> Option<Instant> {
        self.last_write
    }

    /// True when the last write has not been followed by any read.
    pub fn awaiting_read(&self) -> bool {
        match (self.last_read, self.last_write) {
            (Some(read), Some(write)) => read < write,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// =============================================================================
// THROTTLE
// =============================================================================

#[derive(Debug, Clone)]
pub struct WriteThrottle {
    min_interval: Duration,
    max_silence: Duration,
    large_queue: usize,
}

impl WriteThrottle {
    pub fn new(min_interval: Duration, max_silence: Duration, large_queue: usize) -> Self {
        Self {
            min_interval,
            max_silence,
            large_queue,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(
            config.min_write_interval(),
            config.max_silence(),
            config.large_queue_threshold,
        )
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn is_large(&self, queue_len: usize) -> bool {
        queue_len >= self.large_queue
    }

    /// Whether `head` may leave a queue of `queue_len` commands at `now`.
    pub fn permits(&self, now: Instant, head: &Command, queue_len: usize, io: &IoClock) -> bool {
        let since_write = io.last_write.map(|w| now.saturating_duration_since(w));

        if let CommandKind::Delay(delay) = head.kind {
            return since_write.map_or(true, |elapsed| elapsed > delay);
        }

        let Some(since_write) = since_write else {
            return true; // first command always goes out
        };
        if io.last_read.is_none() {
            return true; // player not talking yet, don't get stuck
        }

        let large = self.is_large(queue_len);
        if large && since_write >= self.min_interval / 2 {
            return true;
        }
        if since_write > self.max_silence {
            return true;
        }
        if io.awaiting_read() {
            return false;
        }

        let interval = if large { self.min_interval / 2 } else { self.min_interval };
        since_write >= interval
    }
}

// =============================================================================
// QUEUE
// =============================================================================

#[derive(Debug)]
struct Queued {
    command: Command,
    forced: bool,
}

#[derive(Debug, Default)]
pub struct CommandQueue {
    items: VecDeque<Queued>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, command: Command) {
        self.items.push_back(Queued {
            command,
            forced: false,
        });
    }

    /// Puts `command` ahead of everything that was enqueued normally. Forced
    /// commands keep their relative order and skip the throttle once.
    pub fn force(&mut self, command: Command) {
        let position = self.items.iter().take_while(|q| q.forced).count();
        self.items.insert(
            position,
            Queued {
                command,
                forced: true,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn head(&self) -> Option<&Command> {
        self.items.front().map(|q| &q.command)
    }

    /// Pops the head if it may be sent now.
    pub fn pop_ready(&mut self, now: Instant, io: &IoClock, throttle: &WriteThrottle) -> Option<Command> {
        let head = self.items.front()?;
        if head.forced || throttle.permits(now, &head.command, self.items.len(), io) {
            self.items.pop_front().map(|q| q.command)
        } else {
            None
        }
    }
}
