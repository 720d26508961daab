use std::time::Duration;

/// Errors surfaced by controller operations.
///
/// Media errors reported by the player itself are not returned here; they move
/// the controller into the Error state and arrive as notifications.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("failed to spawn player {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("player process is not running")]
    NotStarted,

    #[error("player process is already running")]
    AlreadyStarted,

    #[error("failed to write command to player: {0}")]
    Write(#[from] std::io::Error),

    #[error(transparent)]
    Seek(#[from] SeekError),

    #[error("gave up after {crashes} consecutive crashes")]
    GaveUp { crashes: u32 },

    #[error("controller thread is gone")]
    Disconnected,
}

/// Why a seek target could not be computed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeekError {
    #[error("cannot seek by percentage: media length unknown")]
    LengthUnknown,

    #[error("seek target {target}s is past the end of the media ({length}s)")]
    PastEnd { target: f64, length: f64 },
}

/// Rejected crop rectangle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CropError {
    #[error("crop {w}x{h}+{x}+{y} does not fit inside {width}x{height}")]
    OutOfFrame {
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        width: u32,
        height: u32,
    },
}

/// Watchdog findings that escalate to the Error state.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LatencyError {
    #[error("no output from player for {elapsed:?} while {state} (expected every {expected:?})")]
    ReadSilence {
        state: &'static str,
        elapsed: Duration,
        expected: Duration,
    },

    #[error("player did not answer for {elapsed:?} after last write (expected within {expected:?})")]
    NoReadAfterWrite { elapsed: Duration, expected: Duration },

    #[error("still loading after {0:?}")]
    LoadTimeout(Duration),
}
