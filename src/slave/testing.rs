//! Scripted player and clock for controller tests.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::core::{ControllerConfig, ControllerError};
use crate::slave::clock::Clock;
use crate::slave::controller::SlaveController;
use crate::slave::events::{ControllerEvent, Notification};
use crate::slave::lines::OutputStream;
use crate::slave::process::{NoPreload, PreloadProbe, SlaveLauncher, SlaveTransport};

#[derive(Debug, Default)]
struct PlayerState {
    written: Vec<String>,
    output: VecDeque<(OutputStream, Vec<u8>)>,
    spawned: Vec<Vec<String>>,
    alive: bool,
    ignore_quit: bool,
    terminated: bool,
    fail_spawn: bool,
    force_killed: Vec<u32>,
}

/// Pid the fake player reports. Kills of it are recorded, never delivered.
pub const MOCK_PID: u32 = 424242;

/// Shared view of a fake player: the test feeds its output and inspects
/// what the controller wrote.
#[derive(Debug, Clone, Default)]
pub struct MockPlayer {
    inner: Arc<Mutex<PlayerState>>,
}

impl MockPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launcher(&self) -> Box<dyn SlaveLauncher> {
        Box::new(MockLauncher { player: self.clone() })
    }

    pub fn stdout(&self, text: &str) {
        self.emit(OutputStream::Stdout, text);
    }

    pub fn stderr(&self, text: &str) {
        self.emit(OutputStream::Stderr, text);
    }

    pub fn emit(&self, stream: OutputStream, text: &str) {
        self.inner.lock().unwrap().output.push_back((stream, text.as_bytes().to_vec()));
    }

    /// Lines written since the last call.
    pub fn take_written(&self) -> Vec<String> {
        std::mem::take(&mut self.inner.lock().unwrap().written)
    }

    pub fn spawn_count(&self) -> usize {
        self.inner.lock().unwrap().spawned.len()
    }

    pub fn last_spawn_args(&self) -> Option<Vec<String>> {
        self.inner.lock().unwrap().spawned.last().cloned()
    }

    pub fn set_alive(&self, alive: bool) {
        self.inner.lock().unwrap().alive = alive;
    }

    pub fn set_ignore_quit(&self, ignore: bool) {
        self.inner.lock().unwrap().ignore_quit = ignore;
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.inner.lock().unwrap().fail_spawn = fail;
    }

    pub fn was_terminated(&self) -> bool {
        self.inner.lock().unwrap().terminated
    }

    pub fn force_killed(&self) -> Vec<u32> {
        self.inner.lock().unwrap().force_killed.clone()
    }
}

struct MockLauncher {
    player: MockPlayer,
}

impl SlaveLauncher for MockLauncher {
    fn spawn(&mut self, program: &Path, args: &[String]) -> Result<Box<dyn SlaveTransport>, ControllerError> {
        let mut state = self.player.inner.lock().unwrap();
        if state.fail_spawn {
            return Err(ControllerError::Spawn {
                program: program.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such player"),
            });
        }
        state.spawned.push(args.to_vec());
        state.alive = true;
        state.terminated = false;
        state.output.clear();
        Ok(Box::new(MockTransport {
            player: self.player.clone(),
        }))
    }

    fn force_kill(&mut self, pid: u32) {
        self.player.inner.lock().unwrap().force_killed.push(pid);
    }
}

struct MockTransport {
    player: MockPlayer,
}

impl SlaveTransport for MockTransport {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut state = self.player.inner.lock().unwrap();
        if !state.alive {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "player is gone"));
        }
        state.written.push(line.to_string());
        if line == "quit" && !state.ignore_quit {
            state.alive = false;
        }
        Ok(())
    }

    fn read_available(&mut self) -> Vec<(OutputStream, Vec<u8>)> {
        self.player.inner.lock().unwrap().output.drain(..).collect()
    }

    fn pid(&self) -> Option<u32> {
        Some(MOCK_PID)
    }

    fn is_alive(&mut self) -> bool {
        self.player.inner.lock().unwrap().alive
    }

    fn wait_for_exit(&mut self, _timeout: Duration) -> bool {
        !self.player.inner.lock().unwrap().alive
    }

    fn terminate_with_escalation(&mut self, _grace: Duration) -> bool {
        let mut state = self.player.inner.lock().unwrap();
        state.alive = false;
        state.terminated = true;
        true
    }
}

/// Clock that only moves when told to; `sleep` advances it.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

pub struct FailingPreload(pub String);

impl PreloadProbe for FailingPreload {
    fn try_preload(&self, _source: &str, _byte_limit: usize, _timeout: Duration) -> Option<String> {
        Some(self.0.clone())
    }
}

pub struct Harness {
    pub controller: SlaveController,
    pub player: MockPlayer,
    pub clock: ManualClock,
    pub events: broadcast::Receiver<Notification>,
}

impl Harness {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_preload(config, Box::new(NoPreload))
    }

    pub fn with_preload(config: ControllerConfig, preload: Box<dyn PreloadProbe>) -> Self {
        let player = MockPlayer::new();
        let clock = ManualClock::new();
        let controller = SlaveController::with_clock(config, player.launcher(), preload, Box::new(clock.clone()));
        let events = controller.subscribe();
        Self {
            controller,
            player,
            clock,
            events,
        }
    }

    pub fn ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    /// Feeds stdout, lets time pass and runs one turn.
    pub fn feed(&mut self, text: &str) {
        self.player.stdout(text);
        self.ms(20);
        self.controller.pump();
    }

    pub fn take_events(&mut self) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(notification) = self.events.try_recv() {
            events.push(notification.event);
        }
        events
    }
}
