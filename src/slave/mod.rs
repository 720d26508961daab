pub mod classifier;
pub mod clock;
pub mod command;
pub mod controller;
pub mod events;
pub mod handle;
pub mod lines;
pub mod position;
pub mod process;
pub mod state;
pub mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use command::SeekMode;
pub use controller::{SlaveController, TrackSelection};
pub use events::{ControllerEvent, Notification};
pub use handle::{ControllerHandle, ControllerSnapshot};
pub use state::ControllerState;
