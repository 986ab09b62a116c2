//! Connection lifecycle state tracking.
//!
//! [`StateMachine`] is pure transition logic: the controller feeds it caller
//! actions (start, stop) and transport notifications and acts on the returned
//! decisions. It performs no I/O and holds no channels, which keeps every
//! lifecycle rule unit-testable without a transport.

use culvert_transport::TransportEvent;

/// Logical state of the tunnel connection.
///
/// Driven by transport notifications and local stop requests. `Cancelled`
/// and `Failed` are terminal for the current attempt; a later start begins
/// a fresh attempt from either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Cancelled,
    Failed(String),
}

impl ConnectionState {
    /// Whether this state ends the current attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Cancelled | ConnectionState::Failed(_))
    }
}

/// Guard against duplicate concurrent start attempts.
///
/// `Initialized` admits a start; any other value means an attempt is in
/// flight and a second start must not spawn a second connection. The first
/// external diagnostic poll after a start advances `Started` to
/// `Connecting`, confirming the control channel is being serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptGuard {
    Initialized,
    Started,
    Connecting,
}

/// Outcome of asking the machine to admit a start call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// No attempt was in flight; one begins now.
    Proceed,
    /// An attempt is already in flight. Log and do nothing.
    AlreadyStarted,
    /// A teardown is still resolving; the start cannot be honored.
    StoppingInProgress,
}

/// Outcome of asking the machine to admit a stop call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// An attempt is active; tear it down.
    Teardown,
    /// A teardown is already underway; join it.
    AlreadyStopping,
    /// Nothing is running; the stop completes immediately.
    NothingToDo,
}

/// What the controller must do after feeding in a transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// State recorded; nothing further to do.
    Noted,
    /// Entered `Connected`. Begin the read loop and the session handshake.
    SessionOpen,
    /// The stream dropped underneath an established session. Begin an
    /// error close; the cancel confirmation finishes the attempt.
    StreamLost,
    /// The attempt reached a terminal state. Fire pending completions and
    /// tear internal stream state down.
    AttemptOver,
    /// The event carries no meaning in the current state.
    Ignored,
}

/// Connection state machine plus start-attempt guard.
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    guard: AttemptGuard,
    stopping: bool,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            guard: AttemptGuard::Initialized,
            stopping: false,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn guard(&self) -> AttemptGuard {
        self.guard
    }

    /// Whether a stop has been accepted and its teardown has not finished.
    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Admit or reject a start call.
    ///
    /// On `Proceed` the state moves to `Connecting` and the guard arms.
    pub fn start(&mut self) -> StartDecision {
        if self.stopping {
            return StartDecision::StoppingInProgress;
        }
        match self.guard {
            AttemptGuard::Initialized => {
                self.guard = AttemptGuard::Started;
                self.state = ConnectionState::Connecting;
                StartDecision::Proceed
            }
            AttemptGuard::Started | AttemptGuard::Connecting => StartDecision::AlreadyStarted,
        }
    }

    /// Admit or reject a stop call.
    ///
    /// On `Teardown` the state moves to `Disconnecting` and later events
    /// resolve the attempt as cancelled.
    pub fn stop(&mut self) -> StopDecision {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.stopping = true;
                self.state = ConnectionState::Disconnecting;
                StopDecision::Teardown
            }
            ConnectionState::Disconnecting => StopDecision::AlreadyStopping,
            _ => StopDecision::NothingToDo,
        }
    }

    /// Record the first external diagnostic poll of this attempt.
    ///
    /// Returns true only on the `Started` to `Connecting` edge.
    pub fn note_poll(&mut self) -> bool {
        if self.guard == AttemptGuard::Started {
            self.guard = AttemptGuard::Connecting;
            true
        } else {
            false
        }
    }

    /// Feed a transport notification through the transition table.
    pub fn apply(&mut self, event: &TransportEvent) -> Transition {
        use ConnectionState as S;
        use TransportEvent as E;

        match (&self.state, event) {
            (S::Connecting, E::Connecting) => Transition::Noted,
            (S::Connecting, E::Connected) => {
                self.state = S::Connected;
                Transition::SessionOpen
            }
            (S::Connecting, E::Failed(reason)) => {
                self.state = S::Failed(reason.clone());
                Transition::AttemptOver
            }
            (S::Connected, E::Disconnected) => {
                self.state = S::Disconnected;
                Transition::StreamLost
            }
            // Stop raced a failing connect attempt; the stop wins.
            (S::Disconnecting, E::Failed(_)) => {
                self.state = S::Cancelled;
                Transition::AttemptOver
            }
            (S::Cancelled | S::Failed(_), E::Cancelled) => Transition::Ignored,
            // Cancellation ends the attempt from every non-terminal state,
            // whether requested locally or imposed by the transport.
            (_, E::Cancelled) => {
                self.state = S::Cancelled;
                Transition::AttemptOver
            }
            _ => Transition::Ignored,
        }
    }

    /// Reset after a full teardown. The terminal state stays visible; the
    /// guard re-arms so a fresh start is admitted.
    pub fn reset(&mut self) {
        self.guard = AttemptGuard::Initialized;
        self.stopping = false;
    }
}
