// =============================================================================
// CONTROLLER HANDLE
// =============================================================================
//
// Runs a `SlaveController` on its own driver thread. Callers talk to it with
// `ControllerRequest` messages and get notifications from the broadcast bus.
// Between requests the driver pumps player output and runs the watchdog.
//
// =============================================================================

use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::{ControllerConfig, ControllerError, MediaInfo};
use crate::slave::command::SeekMode;
use crate::slave::controller::{SlaveController, TrackSelection};
use crate::slave::events::{EventBus, Notification};
use crate::slave::state::ControllerState;

/// How often the driver looks at player output when no request arrives.
const DRIVER_POLL: Duration = Duration::from_millis(20);
const SHUTDOWN_WAIT_ROUNDS: u32 = 30;

type Reply = mpsc::Sender<Result<(), ControllerError>>;

/// Point-in-time view of the controller for display.
#[derive(Debug, Clone)]
pub struct ControllerSnapshot {
    pub state: ControllerState,
    pub position: Option<f64>,
    pub speed: f64,
    pub muted: bool,
    pub audio_track: Option<u32>,
    pub subtitle_track: Option<u32>,
    pub deinterlace: bool,
    pub media: MediaInfo,
}

impl ControllerSnapshot {
    fn capture(controller: &SlaveController) -> Self {
        Self {
            state: controller.state().clone(),
            position: controller.position(),
            speed: controller.speed(),
            muted: controller.is_muted(),
            audio_track: controller.audio_track(),
            subtitle_track: controller.subtitle_track(),
            deinterlace: controller.is_deinterlaced(),
            media: controller.media_info().clone(),
        }
    }
}

pub enum ControllerRequest {
    Start { extra_args: Vec<String>, reply: Reply },
    Load {
        source: String,
        hint: Option<MediaInfo>,
        start_position: Option<f64>,
        reply: Reply,
    },
    Pause { reply: Reply },
    Play { reply: Reply },
    Stop { reply: Reply },
    Seek { offset: f64, mode: SeekMode, reply: Reply },
    SetMuted { muted: bool, reply: Reply },
    SwitchAudioTrack { selection: TrackSelection, reply: Reply },
    SwitchSubtitleTrack { id: Option<u32>, reply: Reply },
    SetSpeed { speed: f64, reply: Reply },
    SetDeinterlace { enabled: bool, reply: Reply },
    ShowOsdText { text: String, duration: Duration, reply: Reply },
    ShowOsdPosition { reply: Reply },
    Delay { delay: Duration, reply: Reply },
    Restart { reply: Reply },
    Quit { reply: Reply },
    Snapshot { reply: mpsc::Sender<ControllerSnapshot> },
    Shutdown,
}

pub struct ControllerHandle {
    request_tx: mpsc::Sender<ControllerRequest>,
    thread_handle: Option<JoinHandle<()>>,
    events: EventBus,
}

impl ControllerHandle {
    /// Starts a driver for a real player process.
    pub fn spawn(config: ControllerConfig) -> Self {
        Self::new(SlaveController::with_process(config))
    }

    pub fn new(controller: SlaveController) -> Self {
        let (request_tx, request_rx) = mpsc::channel();
        let events = controller.event_bus();

        let thread_handle = thread::spawn(move || {
            driver_loop(controller, request_rx);
        });

        Self {
            request_tx,
            thread_handle: Some(thread_handle),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.events.controller_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.events.subscribe()
    }

    fn call(&self, request: impl FnOnce(Reply) -> ControllerRequest) -> Result<(), ControllerError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.request_tx
            .send(request(reply_tx))
            .map_err(|_| ControllerError::Disconnected)?;
        reply_rx.recv().map_err(|_| ControllerError::Disconnected)?
    }

    pub fn start(&self, extra_args: Vec<String>) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Start { extra_args, reply })
    }

    pub fn load(&self, source: &str, hint: Option<MediaInfo>, start_position: Option<f64>) -> Result<(), ControllerError> {
        let source = source.to_string();
        self.call(|reply| ControllerRequest::Load {
            source,
            hint,
            start_position,
            reply,
        })
    }

    pub fn pause(&self) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Pause { reply })
    }

    pub fn play(&self) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Play { reply })
    }

    pub fn stop(&self) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Stop { reply })
    }

    pub fn seek(&self, offset: f64, mode: SeekMode) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Seek { offset, mode, reply })
    }

    pub fn set_muted(&self, muted: bool) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::SetMuted { muted, reply })
    }

    pub fn switch_audio_track(&self, selection: TrackSelection) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::SwitchAudioTrack { selection, reply })
    }

    pub fn switch_subtitle_track(&self, id: Option<u32>) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::SwitchSubtitleTrack { id, reply })
    }

    pub fn set_speed(&self, speed: f64) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::SetSpeed { speed, reply })
    }

    pub fn set_deinterlace(&self, enabled: bool) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::SetDeinterlace { enabled, reply })
    }

    pub fn show_osd_text(&self, text: &str, duration: Duration) -> Result<(), ControllerError> {
        let text = text.to_string();
        self.call(|reply| ControllerRequest::ShowOsdText { text, duration, reply })
    }

    pub fn show_osd_position(&self) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::ShowOsdPosition { reply })
    }

    pub fn delay(&self, delay: Duration) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Delay { delay, reply })
    }

    pub fn restart(&self) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Restart { reply })
    }

    pub fn quit(&self) -> Result<(), ControllerError> {
        self.call(|reply| ControllerRequest::Quit { reply })
    }

    pub fn snapshot(&self) -> Result<ControllerSnapshot, ControllerError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.request_tx
            .send(ControllerRequest::Snapshot { reply: reply_tx })
            .map_err(|_| ControllerError::Disconnected)?;
        reply_rx.recv().map_err(|_| ControllerError::Disconnected)
    }
}

fn driver_loop(mut controller: SlaveController, requests: mpsc::Receiver<ControllerRequest>) {
    log::debug!("Controller driver started");
    loop {
        match requests.recv_timeout(DRIVER_POLL) {
            Ok(ControllerRequest::Shutdown) => break,
            Ok(request) => handle_request(&mut controller, request),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        controller.pump();
        controller.tick();
    }
    controller.quit();
    log::debug!("Controller driver exited");
}

fn handle_request(controller: &mut SlaveController, request: ControllerRequest) {
    // A caller that stopped waiting is not our problem
    let (result, reply) = match request {
        ControllerRequest::Start { extra_args, reply } => (controller.start(&extra_args), reply),
        ControllerRequest::Load {
            source,
            hint,
            start_position,
            reply,
        } => (controller.load(&source, hint, start_position), reply),
        ControllerRequest::Pause { reply } => (controller.pause(), reply),
        ControllerRequest::Play { reply } => (controller.play(), reply),
        ControllerRequest::Stop { reply } => (controller.stop(), reply),
        ControllerRequest::Seek { offset, mode, reply } => (controller.seek(offset, mode), reply),
        ControllerRequest::SetMuted { muted, reply } => (controller.set_muted(muted), reply),
        ControllerRequest::SwitchAudioTrack { selection, reply } => (controller.switch_audio_track(selection), reply),
        ControllerRequest::SwitchSubtitleTrack { id, reply } => (controller.switch_subtitle_track(id), reply),
        ControllerRequest::SetSpeed { speed, reply } => (controller.set_speed(speed), reply),
        ControllerRequest::SetDeinterlace { enabled, reply } => (controller.set_deinterlace(enabled), reply),
        ControllerRequest::ShowOsdText { text, duration, reply } => (controller.show_osd_text(&text, duration), reply),
        ControllerRequest::ShowOsdPosition { reply } => (controller.show_osd_position(), reply),
        ControllerRequest::Delay { delay, reply } => (controller.delay(delay), reply),
        ControllerRequest::Restart { reply } => (controller.restart(), reply),
        ControllerRequest::Quit { reply } => {
            controller.quit();
            (Ok(()), reply)
        }
        ControllerRequest::Snapshot { reply } => {
            let _ = reply.send(ControllerSnapshot::capture(controller));
            return;
        }
        ControllerRequest::Shutdown => return,
    };
    let _ = reply.send(result);
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        log::debug!("ControllerHandle dropping");
        let _ = self.request_tx.send(ControllerRequest::Shutdown);

        if let Some(handle) = self.thread_handle.take() {
            // Quit can take a couple of seconds if the player hangs
            for _ in 0..SHUTDOWN_WAIT_ROUNDS {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                thread::sleep(Duration::from_millis(100));
            }
            log::warn!("Controller driver did not shut down cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slave::events::ControllerEvent;
    use crate::slave::process::NoPreload;
    use crate::slave::testing::MockPlayer;
    use std::time::Instant;

    fn wait_for(events: &mut broadcast::Receiver<Notification>, wanted: &ControllerEvent) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match events.try_recv() {
                Ok(notification) if &notification.event == wanted => return true,
                Ok(_) => {}
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
        false
    }

    #[test]
    fn test_driver_runs_controller() {
        let player = MockPlayer::new();
        let controller = SlaveController::new(ControllerConfig::default(), player.launcher(), Box::new(NoPreload));
        let handle = ControllerHandle::new(controller);
        let mut events = handle.subscribe();

        handle.start(Vec::new()).unwrap();
        handle.load("/media/a.mkv", None, None).unwrap();
        player.stdout("ID_LENGTH=10.0\nStarting playback...\n");

        assert!(wait_for(&mut events, &ControllerEvent::LoadDone));
        let snapshot = handle.snapshot().unwrap();
        assert_eq!(snapshot.state, ControllerState::Playing);
        assert_eq!(snapshot.media.length(), Some(10.0));

        handle.quit().unwrap();
        assert_eq!(handle.snapshot().unwrap().state, ControllerState::NotStarted);
    }

    #[test]
    fn test_errors_come_back_to_caller() {
        let player = MockPlayer::new();
        let controller = SlaveController::new(ControllerConfig::default(), player.launcher(), Box::new(NoPreload));
        let handle = ControllerHandle::new(controller);

        assert!(matches!(handle.pause(), Err(ControllerError::NotStarted)));
        handle.start(Vec::new()).unwrap();
        assert!(matches!(handle.start(Vec::new()), Err(ControllerError::AlreadyStarted)));
    }
}
