use slave_player::core::ControllerConfig;
use slave_player::slave::{ControllerEvent, ControllerHandle, ControllerState, Notification};
use tokio::sync::broadcast::error::RecvError;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let source = args
        .next()
        .ok_or_else(|| anyhow::anyhow!("usage: slave-player <file-or-url> [start-seconds]"))?;
    let start_position = args
        .next()
        .map(|s| s.parse::<f64>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("Invalid start position: {}", e))?;

    let config = ControllerConfig::load()?;
    let handle = ControllerHandle::spawn(config);
    let mut events = handle.subscribe();

    handle.start(Vec::new())?;
    handle.load(&source, None, start_position)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted, quitting");
                    break;
                }
                received = events.recv() => match received {
                    Ok(notification) => {
                        if report(&notification) {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => log::warn!("Missed {} notifications", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    });

    handle.quit()?;
    Ok(())
}

/// Logs one notification; true once playback is over.
fn report(notification: &Notification) -> bool {
    let at = notification.at.format("%H:%M:%S%.3f");
    match &notification.event {
        ControllerEvent::StateChanged { old, new } => {
            log::info!("{} {} -> {}", at, old.name(), new.name());
            matches!(new, ControllerState::Stopped)
        }
        ControllerEvent::PositionChanged(position) => {
            log::debug!("{} position {:.2}s", at, position);
            false
        }
        ControllerEvent::SeekedTo(target) => {
            log::info!("{} seeked to {:.0}s", at, target);
            false
        }
        ControllerEvent::LoadDone => {
            log::info!("{} media identified", at);
            false
        }
        ControllerEvent::Error(reason) => {
            log::error!("{} {}", at, reason);
            true
        }
        ControllerEvent::ErrorAtPosition { .. } => false,
        ControllerEvent::GiveUp { crashes } => {
            log::error!("{} gave up after {} crashes", at, crashes);
            true
        }
    }
}
