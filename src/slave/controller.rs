// =============================================================================
// SLAVE CONTROLLER
// =============================================================================
//
// Owns the player process and everything needed to talk to it: the command
// queue and throttle, the line splitter and classifier, the state machine,
// the position tracker and the latency watchdog.
//
// Nothing here is thread safe; one driver (see `handle.rs`) calls the public
// operations, `pump` and `tick`. Work that classification wants done (a stop,
// a corrective seek) goes onto `deferred` and runs at the start of the next
// pump so the queue and state are never changed while a batch is applied.
//
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::core::{ControllerConfig, ControllerError, LatencyError, MediaInfo, SeekError};
use crate::slave::classifier::{Batch, LineClassifier, MediaAssignment, TrackReport};
use crate::slave::clock::{Clock, SystemClock};
use crate::slave::command::{
    self, Command, CommandKind, CommandQueue, IoClock, Query, SeekMode, WriteThrottle,
};
use crate::slave::events::{short_id, ControllerEvent, EventBus, Notification};
use crate::slave::lines::{LineSplitter, OutputStream};
use crate::slave::position::{PositionCandidate, PositionTracker, Reconciled, TrackerSettings};
use crate::slave::process::{
    FilePreloadProbe, PreloadProbe, ProcessLauncher, SlaveLauncher, SlaveTransport,
};
use crate::slave::state::{ControllerState, StateMachine, Transition};
use crate::slave::watchdog::{LatencyWatchdog, WatchdogVerdict};

/// Upper bound on synchronous drain rounds when the queue overflows.
const MAX_DRAIN_ITERATIONS: usize = 200;
const OSD_POSITION_MS: u32 = 1000;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSelection {
    Id(u32),
    Next,
}

/// Follow-up work requested while a batch was being applied.
#[derive(Debug, Clone, PartialEq)]
enum Deferred {
    Stop,
    /// Absolute seek that fixes audio/video drift
    CorrectDesync(f64),
    /// Start offset requested at load, applied once metadata is in
    SeekToStart(f64),
}

pub struct SlaveController {
    config: ControllerConfig,
    clock: Box<dyn Clock>,
    launcher: Box<dyn SlaveLauncher>,
    preload: Box<dyn PreloadProbe>,
    transport: Option<Box<dyn SlaveTransport>>,

    queue: CommandQueue,
    throttle: WriteThrottle,
    io: IoClock,
    splitter: LineSplitter,
    classifier: LineClassifier,
    machine: StateMachine,
    tracker: PositionTracker,
    watchdog: LatencyWatchdog,
    media: MediaInfo,

    deferred: VecDeque<Deferred>,
    parsing: bool,
    load_deadline: Option<Instant>,
    load_done_sent: bool,
    pending_start: Option<f64>,

    // Assumed player-side settings, updated before the player confirms
    muted: bool,
    audio_track: Option<u32>,
    subtitle_track: Option<u32>,
    deinterlace: bool,

    crashes: u32,
    last_args: Vec<String>,
    events: EventBus,
    tag: String,
}

impl SlaveController {
    /// Controller for a real player binary.
    pub fn with_process(config: ControllerConfig) -> Self {
        Self::new(config, Box::new(ProcessLauncher), Box::new(FilePreloadProbe))
    }

    pub fn new(config: ControllerConfig, launcher: Box<dyn SlaveLauncher>, preload: Box<dyn PreloadProbe>) -> Self {
        Self::with_clock(config, launcher, preload, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: ControllerConfig,
        launcher: Box<dyn SlaveLauncher>,
        preload: Box<dyn PreloadProbe>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let id = Uuid::new_v4();
        let tag = short_id(id);
        log::info!("[{}] Controller created for {:?}", tag, config.player_path);

        Self {
            throttle: WriteThrottle::from_config(&config),
            tracker: PositionTracker::new(TrackerSettings::from_config(&config)),
            watchdog: LatencyWatchdog::from_config(&config),
            config,
            clock,
            launcher,
            preload,
            transport: None,
            queue: CommandQueue::new(),
            io: IoClock::default(),
            splitter: LineSplitter::new(),
            classifier: LineClassifier::new(),
            machine: StateMachine::new(),
            media: MediaInfo::new(),
            deferred: VecDeque::new(),
            parsing: false,
            load_done_sent: false,
            load_deadline: None,
            pending_start: None,
            muted: false,
            audio_track: None,
            subtitle_track: None,
            deinterlace: false,
            crashes: 0,
            last_args: Vec::new(),
            events: EventBus::new(id, EVENT_CAPACITY),
            tag,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> Uuid {
        self.events.controller_id()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    pub fn state(&self) -> &ControllerState {
        self.machine.state()
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.media
    }

    pub fn is_started(&self) -> bool {
        self.transport.is_some()
    }

    /// Tracked position, only while there is something playing to point at.
    pub fn position(&self) -> Option<f64> {
        self.masked_position(self.clock.now())
    }

    pub fn speed(&self) -> f64 {
        self.tracker.speed()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn audio_track(&self) -> Option<u32> {
        self.audio_track
    }

    pub fn subtitle_track(&self) -> Option<u32> {
        self.subtitle_track
    }

    pub fn is_deinterlaced(&self) -> bool {
        self.deinterlace
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// How long the driver may sleep before the next `tick` is due.
    pub fn poll_interval(&self) -> Duration {
        self.watchdog.period()
    }

    fn masked_position(&self, now: Instant) -> Option<f64> {
        let state = self.machine.state();
        if !state.has_position() {
            return None;
        }
        self.tracker.expected_position(now, state.is_playing())
    }

    fn is_playing(&self) -> bool {
        self.machine.state().is_playing()
    }

    fn require_started(&self) -> Result<(), ControllerError> {
        if self.transport.is_none() {
            return Err(ControllerError::NotStarted);
        }
        Ok(())
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    pub fn start(&mut self, extra_args: &[String]) -> Result<(), ControllerError> {
        if self.transport.is_some() {
            return Err(ControllerError::AlreadyStarted);
        }

        let mut args = self.config.baseline_args.clone();
        args.extend(extra_args.iter().cloned());
        let transport = self.launcher.spawn(&self.config.player_path, &args)?;

        log::info!("[{}] Player started", self.tag);
        self.transport = Some(transport);
        self.last_args = extra_args.to_vec();
        self.reset_runtime();
        self.io.reset();

        let now = self.clock.now();
        if let Some(transition) = self.machine.reset(ControllerState::Idle) {
            self.on_transition(transition, now);
        }
        Ok(())
    }

    /// Stops the player with escalating force. Safe to call any number of
    /// times; never fails.
    pub fn quit(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let pid = transport.pid();
            log::info!("[{}] Quitting player (pid {:?})", self.tag, pid);

            if let Err(e) = transport.write_line(command::QUIT) {
                log::debug!("[{}] Could not send quit: {}", self.tag, e);
            }
            let timeout = self.config.quit_timeout();
            if !transport.wait_for_exit(timeout) {
                log::warn!("[{}] Player did not quit within {:?}", self.tag, timeout);
                if !transport.terminate_with_escalation(timeout) {
                    log::warn!("[{}] Player still running after terminate", self.tag);
                }
            }
            drop(transport);

            // Out of band, even after a clean exit
            if let Some(pid) = pid {
                self.launcher.force_kill(pid);
            }
        }

        self.reset_runtime();
        self.io.reset();
        let now = self.clock.now();
        if let Some(transition) = self.machine.reset(ControllerState::NotStarted) {
            self.on_transition(transition, now);
        }
    }

    /// Quits and starts again with the arguments of the last `start`. A
    /// restart out of Error counts as a crash; too many in a row and the
    /// controller gives up.
    pub fn restart(&mut self) -> Result<(), ControllerError> {
        if self.machine.state().is_error() {
            self.crashes += 1;
            log::warn!("[{}] Restarting after crash #{}", self.tag, self.crashes);
        }
        if self.crashes > self.config.max_restart_crashes {
            log::error!("[{}] Giving up after {} crashes", self.tag, self.crashes);
            self.events.emit(ControllerEvent::GiveUp { crashes: self.crashes });
            return Err(ControllerError::GaveUp { crashes: self.crashes });
        }

        let args = self.last_args.clone();
        self.quit();
        self.start(&args)
    }

    fn reset_runtime(&mut self) {
        self.queue.clear();
        self.splitter.clear();
        self.classifier.reset();
        self.tracker.reset();
        self.media = MediaInfo::new();
        self.deferred.clear();
        self.parsing = false;
        self.load_deadline = None;
        self.load_done_sent = false;
        self.pending_start = None;
        self.muted = false;
        self.audio_track = None;
        self.subtitle_track = None;
        self.deinterlace = false;
    }

    // =========================================================================
    // PLAYBACK OPERATIONS
    // =========================================================================

    /// Opens `source`. `hint` seeds the media description with what the
    /// caller already knows; `start_position` is sought to once the player has
    /// identified the streams.
    pub fn load(
        &mut self,
        source: &str,
        hint: Option<MediaInfo>,
        start_position: Option<f64>,
    ) -> Result<(), ControllerError> {
        self.require_started()?;
        log::info!("[{}] Loading {}", self.tag, source);

        self.queue.clear();
        if matches!(self.machine.state(), ControllerState::Paused | ControllerState::Playing) {
            self.queue.enqueue(Command::text(command::NEXT_ITEM, self.clock.now()));
        }

        if let Some(reason) = self.preload.try_preload(
            source,
            self.config.preload_byte_limit,
            self.config.preload_timeout(),
        ) {
            log::warn!("[{}] Preload failed: {}", self.tag, reason);
            let now = self.clock.now();
            // A load is a fresh attempt, so it gets reported even out of Error
            if self.machine.state().is_error() {
                if let Some(transition) = self.machine.reset(ControllerState::Loading) {
                    self.on_transition(transition, now);
                }
            }
            self.enter_error(reason, now);
            return Ok(());
        }

        // Whatever the player said about the previous source is stale now
        if let Some(transport) = self.transport.as_mut() {
            let dropped = transport.read_available();
            log::debug!("[{}] Dropped {} stale output chunks", self.tag, dropped.len());
        }
        self.splitter.clear();
        self.classifier.reset();
        self.deferred.clear();

        let now = self.clock.now();
        let mut media = hint.unwrap_or_default();
        if media.is_finalized() {
            media.unfinalize();
        }
        self.media = media;

        let start = start_position.filter(|s| *s > 0.0);
        self.tracker.note_load(start.unwrap_or(0.0), now);
        self.tracker.set_length(self.media.length());

        if let Some(transition) = self.machine.reset(ControllerState::Loading) {
            self.on_transition(transition, now);
        }
        self.parsing = true;
        self.load_done_sent = false;
        self.pending_start = start;
        self.load_deadline = Some(now + self.config.load_timeout());

        self.submit(Command::text(command::loadfile_literal(source), now));
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), ControllerError> {
        self.toggle_towards(ControllerState::Playing, ControllerState::Paused)
    }

    pub fn play(&mut self) -> Result<(), ControllerError> {
        self.toggle_towards(ControllerState::Paused, ControllerState::Playing)
    }

    fn toggle_towards(&mut self, from: ControllerState, to: ControllerState) -> Result<(), ControllerError> {
        self.require_started()?;
        let now = self.clock.now();

        if self.machine.state() == &from {
            self.queue.force(Command::text(command::PAUSE_TOGGLE, now));
            self.set_state(to, now);
        }
        // Ask either way: the player may not be where we think it is
        self.queue.force(Command::query(Query::Pause, now));
        self.queue.force(Command::query(Query::Position, now));
        self.try_flush(now);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), ControllerError> {
        self.require_started()?;
        self.stop_now();
        Ok(())
    }

    fn stop_now(&mut self) {
        log::info!("[{}] Stopping playback", self.tag);
        let now = self.clock.now();
        self.queue.force(Command::text(command::STOP, now));
        self.try_flush(now);

        self.clock.sleep(self.config.stop_flush());
        if let Some(transport) = self.transport.as_mut() {
            let _ = transport.read_available();
        }
        self.splitter.clear();
        self.queue.clear();
        self.classifier.clear_expectations();
        self.pending_start = None;

        let now = self.clock.now();
        self.set_state(ControllerState::Stopped, now);
    }

    /// Seeks now if possible, otherwise once the command reaches the head of
    /// the queue. A target past the end stops playback.
    pub fn seek(&mut self, offset: f64, mode: SeekMode) -> Result<(), ControllerError> {
        self.require_started()?;
        let now = self.clock.now();

        match self.tracker.compute_seek_target(offset, mode, now, self.is_playing()) {
            Ok(_) => {}
            Err(e @ SeekError::PastEnd { .. }) => {
                log::info!("[{}] {}; stopping", self.tag, e);
                self.stop_now();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        self.queue.enqueue(Command::seek(offset, mode, now));
        self.queue.force(Command::query(Query::Position, now));
        self.try_flush(now);
        Ok(())
    }

    pub fn set_muted(&mut self, muted: bool) -> Result<(), ControllerError> {
        self.require_started()?;
        self.muted = muted;
        self.submit(Command::text(command::mute_literal(muted), self.clock.now()));
        Ok(())
    }

    pub fn switch_audio_track(&mut self, selection: TrackSelection) -> Result<(), ControllerError> {
        self.require_started()?;
        let now = self.clock.now();
        match selection {
            TrackSelection::Id(id) => {
                self.audio_track = Some(id);
                self.submit(Command::text(command::audio_track_literal(Some(id)), now));
            }
            TrackSelection::Next => {
                let tracks = self.media.audio_tracks();
                let current = self.audio_track.or_else(|| tracks.ids().next());
                self.audio_track = tracks.next_after(current);
                self.queue.enqueue(Command::text(command::audio_track_literal(None), now));
                self.submit(Command::query(Query::AudioTrack, now));
            }
        }
        Ok(())
    }

    pub fn switch_subtitle_track(&mut self, id: Option<u32>) -> Result<(), ControllerError> {
        self.require_started()?;
        self.subtitle_track = id;
        self.submit(Command::text(command::subtitle_track_literal(id), self.clock.now()));
        Ok(())
    }

    pub fn set_speed(&mut self, speed: f64) -> Result<(), ControllerError> {
        self.require_started()?;
        if !(speed.is_finite() && speed > 0.0) {
            log::warn!("[{}] Ignoring invalid playback speed {}", self.tag, speed);
            return Ok(());
        }

        let now = self.clock.now();
        let playing = self.is_playing();
        self.tracker.set_speed(speed, now, playing);
        self.queue.enqueue(Command::text(command::speed_literal(speed), now));
        self.submit(Command::query(Query::Speed, now));
        Ok(())
    }

    pub fn set_deinterlace(&mut self, enabled: bool) -> Result<(), ControllerError> {
        self.require_started()?;
        self.deinterlace = enabled;
        self.submit(Command::text(command::deinterlace_literal(enabled), self.clock.now()));
        Ok(())
    }

    pub fn show_osd_text(&mut self, text: &str, duration: Duration) -> Result<(), ControllerError> {
        self.require_started()?;
        let duration_ms = duration.as_millis().min(u32::MAX as u128) as u32;
        self.submit(Command::text(command::osd_literal(text, duration_ms), self.clock.now()));
        Ok(())
    }

    /// Shows the position as it is when the command actually goes out.
    pub fn show_osd_position(&mut self) -> Result<(), ControllerError> {
        self.require_started()?;
        let now = self.clock.now();
        self.submit(Command::new(
            CommandKind::OsdLocation {
                duration_ms: OSD_POSITION_MS,
            },
            now,
        ));
        Ok(())
    }

    /// Holds back everything queued after it until `delay` has passed since
    /// the last write.
    pub fn delay(&mut self, delay: Duration) -> Result<(), ControllerError> {
        self.require_started()?;
        self.submit(Command::delay(delay, self.clock.now()));
        Ok(())
    }

    // =========================================================================
    // DRIVER ENTRY POINTS
    // =========================================================================

    /// One scheduling turn: deferred work, then output, then the queue.
    pub fn pump(&mut self) {
        let now = self.clock.now();
        self.run_deferred(now);

        let chunks = match self.transport.as_mut() {
            Some(transport) => transport.read_available(),
            None => return,
        };
        for (stream, bytes) in chunks {
            self.handle_output(stream, &bytes, now);
        }
        self.try_flush(now);
    }

    /// Periodic watchdog check. Cheap when nothing is due.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        if self.transport.is_none() || !LatencyWatchdog::is_active(self.machine.state(), self.queue.len()) {
            return;
        }
        if !self.watchdog.is_due(now) {
            return;
        }
        self.watchdog.mark_tick(now);
        self.try_flush(now);

        if let Some(deadline) = self.load_deadline {
            if now >= deadline {
                let reason = LatencyError::LoadTimeout(self.config.load_timeout()).to_string();
                log::error!("[{}] {}", self.tag, reason);
                self.enter_error(reason, now);
                return;
            }
        }

        let alive = self.transport.as_mut().is_some_and(|t| t.is_alive());
        if !alive {
            // Pick up whatever it said on the way out
            self.pump();
            if self.machine.state().is_active() {
                self.enter_error("player exited unexpectedly".to_string(), now);
            }
            return;
        }

        match self.watchdog.check(now, self.machine.state(), &self.io) {
            WatchdogVerdict::Quiet => {}
            WatchdogVerdict::Warn(message) => log::warn!("[{}] Player slow: {}", self.tag, message),
            WatchdogVerdict::Escalate(error) => {
                log::error!("[{}] Player unresponsive: {}", self.tag, error);
                self.enter_error(error.to_string(), now);
            }
        }
    }

    // =========================================================================
    // OUTPUT HANDLING
    // =========================================================================

    fn handle_output(&mut self, stream: OutputStream, bytes: &[u8], now: Instant) {
        self.io.note_read(now);
        let lines = self.splitter.push(stream, bytes);
        if !self.parsing {
            for line in &lines {
                log::debug!("[{}] Not parsing, dropped {} line: {}", self.tag, stream, line);
            }
            return;
        }

        let mut batch = Batch::default();
        for line in &lines {
            log::trace!("[{}] {} < {}", self.tag, stream, line);
            batch.absorb(self.classifier.classify(line, self.machine.state()));
        }
        if !batch.is_empty() {
            self.apply_batch(batch, now);
        }
    }

    fn apply_batch(&mut self, batch: Batch, now: Instant) {
        let error = batch.error_reason();

        for assignment in batch.media {
            if self.media.is_finalized() && assignment != MediaAssignment::Reidentify {
                log::debug!("[{}] Dropping late media field {:?}", self.tag, assignment);
                continue;
            }
            assignment.apply(&mut self.media);
        }
        self.tracker.set_length(self.media.length());

        if batch.metadata_complete {
            if !self.media.is_finalized() {
                self.media.finalize();
            }
            if !self.load_done_sent {
                self.load_done_sent = true;
                log::info!(
                    "[{}] Media identified (length {:?}, video {})",
                    self.tag,
                    self.media.length(),
                    self.media.has_video()
                );
                self.events.emit(ControllerEvent::LoadDone);
                if let Some(start) = self.pending_start.take() {
                    self.deferred.push_back(Deferred::SeekToStart(start));
                }
            }
        }

        // An error in the same batch wins over any hint
        if let (Some(hint), None) = (batch.state_hint, error.as_ref()) {
            self.set_state(hint, now);
        }

        if let Some(candidate) = batch.position {
            self.apply_position(&candidate, now);
        }

        if let Some(reason) = error {
            self.enter_error(reason, now);
        }

        if let Some(speed) = batch.speed {
            if (speed - self.tracker.speed()).abs() > f64::EPSILON {
                let playing = self.is_playing();
                self.tracker.set_speed(speed, now, playing);
            }
        }

        for report in batch.tracks {
            match report {
                TrackReport::Audio(id) => self.audio_track = id,
            }
        }
    }

    fn apply_position(&mut self, candidate: &PositionCandidate, now: Instant) {
        let state = self.machine.state().clone();
        if !matches!(
            state,
            ControllerState::Playing | ControllerState::Paused | ControllerState::Buffering | ControllerState::Loading
        ) {
            return;
        }

        match self.tracker.reconcile(candidate, now, state.is_playing()) {
            Reconciled::Discarded => {}
            Reconciled::Accepted {
                value,
                notify,
                correction,
            } => {
                if notify && state.has_position() {
                    self.events.emit(ControllerEvent::PositionChanged(value));
                }
                if let Some(target) = correction {
                    self.deferred.push_back(Deferred::CorrectDesync(target));
                }
                // Status lines flowing again means the cache refilled
                if state == ControllerState::Buffering && !candidate.explicit {
                    self.set_state(ControllerState::Playing, now);
                }
            }
        }
    }

    fn run_deferred(&mut self, now: Instant) {
        while let Some(action) = self.deferred.pop_front() {
            match action {
                Deferred::Stop => {
                    if self.transport.is_some() {
                        self.stop_now();
                    }
                }
                Deferred::CorrectDesync(target) => {
                    self.queue.force(Command::seek(target, SeekMode::Absolute, now));
                    self.queue.force(Command::query(Query::Position, now));
                }
                Deferred::SeekToStart(target) => {
                    log::debug!("[{}] Seeking to start offset {:.2}s", self.tag, target);
                    self.queue.enqueue(Command::seek(target, SeekMode::Absolute, now));
                    self.queue.enqueue(Command::query(Query::Position, now));
                }
            }
        }
    }

    // =========================================================================
    // STATE
    // =========================================================================

    fn set_state(&mut self, new: ControllerState, now: Instant) {
        if let Some(transition) = self.machine.transition(new) {
            self.on_transition(transition, now);
        }
    }

    fn on_transition(&mut self, transition: Transition, now: Instant) {
        log::info!(
            "[{}] State {} -> {}",
            self.tag,
            transition.old.name(),
            transition.new.name()
        );

        if transition.crosses_playing() {
            self.tracker.clear_anchor(now, transition.old.is_playing());
        }
        match &transition.new {
            ControllerState::Playing => {
                self.crashes = 0;
                self.load_deadline = None;
            }
            ControllerState::Paused => self.load_deadline = None,
            ControllerState::Stopped | ControllerState::Error(_) => {
                self.parsing = false;
                self.load_deadline = None;
            }
            _ => {}
        }

        self.events.emit(ControllerEvent::StateChanged {
            old: transition.old,
            new: transition.new,
        });
    }

    /// Moves to Error. The player keeps running; `load`, `start` or `restart`
    /// get out of it. While already in Error further errors are dropped.
    fn enter_error(&mut self, reason: String, now: Instant) {
        let position = self.masked_position(now);
        let Some(transition) = self.machine.transition(ControllerState::Error(reason.clone())) else {
            log::debug!("[{}] Already in error, dropping: {}", self.tag, reason);
            return;
        };
        log::error!("[{}] Error: {}", self.tag, reason);

        self.queue.clear();
        self.splitter.clear();
        self.classifier.clear_expectations();
        self.deferred.clear();
        self.pending_start = None;

        self.on_transition(transition, now);
        self.events.emit(ControllerEvent::Error(reason.clone()));
        self.events.emit(ControllerEvent::ErrorAtPosition { reason, position });
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    fn submit(&mut self, command: Command) {
        self.queue.enqueue(command);
        if self.queue.len() > self.config.hard_queue_cap {
            self.drain_overflow();
        } else {
            let now = self.clock.now();
            self.try_flush(now);
        }
    }

    fn drain_overflow(&mut self) {
        log::warn!(
            "[{}] Command queue overflow ({} pending), draining",
            self.tag,
            self.queue.len()
        );
        let pace = self.throttle.min_interval() / 2;
        let mut iterations = 0;
        while self.queue.len() > self.config.large_queue_threshold && iterations < MAX_DRAIN_ITERATIONS {
            if self.transport.is_none() {
                break;
            }
            self.pump();
            self.clock.sleep(pace);
            iterations += 1;
        }
        log::debug!(
            "[{}] Drained to {} pending after {} rounds",
            self.tag,
            self.queue.len(),
            iterations
        );
    }

    fn try_flush(&mut self, now: Instant) {
        if self.transport.is_none() {
            return;
        }
        while let Some(command) = self.queue.pop_ready(now, &self.io, &self.throttle) {
            if let Err(e) = self.send(command, now) {
                log::warn!("[{}] {}", self.tag, e);
            }
        }
    }

    fn send(&mut self, command: Command, now: Instant) -> Result<(), ControllerError> {
        match command.kind() {
            CommandKind::Delay(delay) => {
                log::trace!("[{}] Delay of {:?} released", self.tag, delay);
                Ok(())
            }
            CommandKind::Text(text) => self.write(text, now),
            CommandKind::Query(query) => {
                self.write(query.literal(), now)?;
                self.classifier.expect(*query);
                Ok(())
            }
            CommandKind::Seek { offset, mode } => {
                let playing = self.is_playing();
                match self.tracker.compute_seek_target(*offset, *mode, now, playing) {
                    Ok(target) => {
                        self.write(&command::seek_literal(target), now)?;
                        self.tracker.note_seek(target, now, playing);
                        self.events.emit(ControllerEvent::SeekedTo(target));
                        Ok(())
                    }
                    Err(e @ SeekError::PastEnd { .. }) => {
                        log::info!("[{}] {} at send time; stopping", self.tag, e);
                        self.deferred.push_back(Deferred::Stop);
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            CommandKind::OsdLocation { duration_ms } => {
                let text = self.osd_position_text(now);
                self.write(&command::osd_literal(&text, *duration_ms), now)
            }
        }
    }

    fn osd_position_text(&self, now: Instant) -> String {
        let position = command::format_clock(self.masked_position(now).unwrap_or(0.0));
        match self.media.length() {
            Some(length) => format!("{} / {}", position, command::format_clock(length)),
            None => position,
        }
    }

    fn write(&mut self, line: &str, now: Instant) -> Result<(), ControllerError> {
        let transport = self.transport.as_mut().ok_or(ControllerError::NotStarted)?;
        log::debug!("[{}] > {}", self.tag, line);
        transport.write_line(line)?;
        self.io.note_write(now);
        Ok(())
    }
}

impl Drop for SlaveController {
    fn drop(&mut self) {
        log::debug!("[{}] Controller dropping", self.tag);
        self.quit();
    }
}
