#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    NotStarted,
    Idle,
    Loading,
    Stopped,
    Playing,
    Buffering,
    Paused,
    Error(String),
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::NotStarted => "not started",
            ControllerState::Idle => "idle",
            ControllerState::Loading => "loading",
            ControllerState::Stopped => "stopped",
            ControllerState::Playing => "playing",
            ControllerState::Buffering => "buffering",
            ControllerState::Paused => "paused",
            ControllerState::Error(_) => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ControllerState::Error(_))
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, ControllerState::Playing)
    }

    /// States in which the player is expected to keep talking.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ControllerState::Loading | ControllerState::Playing | ControllerState::Buffering
        )
    }

    /// States in which a position is meaningful to show.
    pub fn has_position(&self) -> bool {
        matches!(
            self,
            ControllerState::Playing | ControllerState::Paused | ControllerState::Buffering
        )
    }

    pub fn error_reason(&self) -> Option<&str> {
        match self {
            ControllerState::Error(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub old: ControllerState,
    pub new: ControllerState,
}

impl Transition {
    /// Entering or leaving Playing invalidates the position anchor.
    pub fn crosses_playing(&self) -> bool {
        self.old.is_playing() != self.new.is_playing()
    }
}

/// Holds the authoritative state. Error sticks until `reset`.
#[derive(Debug)]
pub struct StateMachine {
    state: ControllerState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: ControllerState::NotStarted,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Moves to `new`. Returns `None` for same-state requests and for
    /// anything at all while in Error, a second error included.
    pub fn transition(&mut self, new: ControllerState) -> Option<Transition> {
        if self.state == new {
            return None;
        }
        if self.state.is_error() {
            log::debug!("Ignoring transition to {} while in error", new.name());
            return None;
        }
        let old = std::mem::replace(&mut self.state, new.clone());
        Some(Transition { old, new })
    }

    /// Explicit reset out of any state, including Error.
    pub fn reset(&mut self, new: ControllerState) -> Option<Transition> {
        if self.state == new {
            return None;
        }
        let old = std::mem::replace(&mut self.state, new.clone());
        Some(Transition { old, new })
    }
}
