//! Controller state machine: explicit states with a checked transition
//! table plus exclusive operation flags. State is shared between the
//! controller's owner reactor and observers on other threads.

use parking_lot::Mutex;

/// Why a controller entered the Faulted state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControllerFailureReason {
    ResetFailed,
    ResetTimeout,
    Shutdown,
    NamespaceInit,
}

/// Controller life cycle states.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NvmeControllerState {
    /// Controller structure exists, no transport attachment yet.
    New,
    /// Transport attachment in progress.
    Initializing,
    /// Attached and serving I/O.
    Running,
    /// Reset in progress: qpairs are torn down and rebuilt.
    Resetting,
    /// Waiting for the reconnect timer after a failed reset.
    ReconnectDelayed,
    /// Shutdown in progress.
    Unconfiguring,
    /// All resources released.
    Unconfigured,
    /// Unusable until reset or shutdown.
    Faulted(ControllerFailureReason),
}

impl std::fmt::Display for NvmeControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Exclusive operation flags; at most one holder each.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControllerFlag {
    /// A reset cycle is active.
    ResetActive,
    /// An ANA log page read is in flight.
    AnaLogUpdateActive,
}

/// A rejected state transition or flag operation.
#[derive(Debug)]
pub struct ControllerStateError {
    pub from: NvmeControllerState,
    pub to: NvmeControllerState,
}

#[derive(Debug)]
pub struct ControllerStateMachine {
    name: String,
    state: Mutex<NvmeControllerState>,
    flags: Mutex<[bool; 2]>,
}

fn transition_allowed(
    from: NvmeControllerState,
    to: NvmeControllerState,
) -> bool {
    use NvmeControllerState::*;

    match (from, to) {
        (New, Initializing) => true,
        (Initializing, Running) | (Initializing, Faulted(_)) => true,
        (Running, Resetting)
        | (Running, Unconfiguring)
        | (Running, Faulted(_)) => true,
        (Faulted(_), Resetting)
        | (Faulted(_), ReconnectDelayed)
        | (Faulted(_), Unconfiguring) => true,
        (Resetting, Running)
        | (Resetting, Faulted(_))
        | (Resetting, ReconnectDelayed)
        | (Resetting, Unconfiguring) => true,
        (ReconnectDelayed, Resetting) | (ReconnectDelayed, Unconfiguring) => {
            true
        }
        (Unconfiguring, Unconfigured) => true,
        _ => false,
    }
}

impl ControllerStateMachine {
    pub fn new(name: &str) -> Self {
        Self {
            name: String::from(name),
            state: Mutex::new(NvmeControllerState::New),
            flags: Mutex::new([false; 2]),
        }
    }

    pub fn current_state(&self) -> NvmeControllerState {
        *self.state.lock()
    }

    /// Unconditionally transitions to the new state, provided the
    /// transition is legal.
    pub fn transition(
        &self,
        to: NvmeControllerState,
    ) -> Result<(), ControllerStateError> {
        let mut state = self.state.lock();
        if !transition_allowed(*state, to) {
            return Err(ControllerStateError {
                from: *state,
                to,
            });
        }
        debug!("{}: state {} -> {}", self.name, *state, to);
        *state = to;
        Ok(())
    }

    /// Transitions only when the current state equals `from`.
    pub fn transition_checked(
        &self,
        from: NvmeControllerState,
        to: NvmeControllerState,
    ) -> Result<(), ControllerStateError> {
        let mut state = self.state.lock();
        if *state != from || !transition_allowed(from, to) {
            return Err(ControllerStateError {
                from: *state,
                to,
            });
        }
        debug!("{}: state {} -> {}", self.name, *state, to);
        *state = to;
        Ok(())
    }

    /// Raises a flag; fails when it is already raised.
    pub fn set_flag_exclusively(
        &self,
        flag: ControllerFlag,
    ) -> Result<(), ControllerFlag> {
        let mut flags = self.flags.lock();
        let f = &mut flags[flag as usize];
        if *f {
            Err(flag)
        } else {
            *f = true;
            Ok(())
        }
    }

    /// Clears a flag; fails when it was not raised.
    pub fn clear_flag_exclusively(
        &self,
        flag: ControllerFlag,
    ) -> Result<(), ControllerFlag> {
        let mut flags = self.flags.lock();
        let f = &mut flags[flag as usize];
        if *f {
            *f = false;
            Ok(())
        } else {
            Err(flag)
        }
    }

    pub fn has_flag(&self, flag: ControllerFlag) -> bool {
        self.flags.lock()[flag as usize]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use NvmeControllerState::*;

    #[test]
    fn legal_life_cycle() {
        let sm = ControllerStateMachine::new("sm");
        sm.transition(Initializing).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Resetting).unwrap();
        sm.transition(ReconnectDelayed).unwrap();
        sm.transition(Resetting).unwrap();
        sm.transition(Running).unwrap();
        sm.transition(Unconfiguring).unwrap();
        sm.transition(Unconfigured).unwrap();
    }

    #[test]
    fn illegal_transitions_rejected() {
        let sm = ControllerStateMachine::new("sm");
        assert!(sm.transition(Running).is_err());
        sm.transition(Initializing).unwrap();
        assert!(sm.transition(Unconfigured).is_err());
        sm.transition(Running).unwrap();
        assert!(sm.transition(Initializing).is_err());
    }

    #[test]
    fn checked_transition() {
        let sm = ControllerStateMachine::new("sm");
        sm.transition(Initializing).unwrap();
        sm.transition(Running).unwrap();
        assert!(sm
            .transition_checked(Resetting, Running)
            .is_err());
        sm.transition_checked(Running, Resetting).unwrap();
    }

    #[test]
    fn flags_are_exclusive() {
        let sm = ControllerStateMachine::new("sm");
        sm.set_flag_exclusively(ControllerFlag::ResetActive).unwrap();
        assert!(sm.set_flag_exclusively(ControllerFlag::ResetActive).is_err());
        sm.clear_flag_exclusively(ControllerFlag::ResetActive).unwrap();
        assert!(sm
            .clear_flag_exclusively(ControllerFlag::ResetActive)
            .is_err());
    }
}
