//! Session connection state machine.
//!
//! ```text
//!                open()            established
//! Disconnected ---------> Connecting ---------> Open
//!      ^                   ^    |                 |
//!      |       retry delay |    | failed          | closed / error
//!      |                   |    v                 |
//!      |               Reconnecting <-------------+
//!      |
//!      +---- close() from any phase (terminal)
//! ```

use crate::latency::LatencyTracker;
use std::fmt;
use tracing::debug;

/// Connection phase of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
}

/// Signals that drive [`SessionPhase`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    OpenRequested,
    TransportEstablished,
    TransportFailed,
    TransportClosed,
    RetryElapsed,
    CloseRequested,
}

impl SessionPhase {
    /// Phase reached from `self` on `event`, or `None` if the event is not
    /// valid in this phase.
    pub fn next(self, event: PhaseEvent) -> Option<SessionPhase> {
        use PhaseEvent::*;
        use SessionPhase::*;

        match (self, event) {
            (_, CloseRequested) => Some(Disconnected),
            (Disconnected, OpenRequested) => Some(Connecting),
            (Connecting, TransportEstablished) => Some(Open),
            (Connecting, TransportFailed) => Some(Reconnecting),
            (Open, TransportClosed) | (Open, TransportFailed) => Some(Reconnecting),
            (Reconnecting, RetryElapsed) => Some(Connecting),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        self == SessionPhase::Open
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Open => "open",
            SessionPhase::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a viewer tile should show besides the picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Indicator {
    #[default]
    Idle,
    /// Connected, no frame drawn yet
    AwaitingFrames,
    /// Connection lost, retry pending
    AwaitingReconnect,
}

/// Mutable state of one camera session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub camera_id: String,
    pub endpoint: String,
    phase: SessionPhase,
    pub latency: LatencyTracker,
    /// Bumped every time the phase enters `Open`
    connection: u64,
    closed: bool,
}

impl SessionState {
    pub fn new(camera_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            endpoint: endpoint.into(),
            phase: SessionPhase::Disconnected,
            latency: LatencyTracker::new(),
            connection: 0,
            closed: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// True once the session has been closed. Closed state accepts no events.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Identifier of the current (or most recent) open connection.
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// True while `connection` is the live one. Frames read from an earlier
    /// connection must not be drawn.
    pub fn is_live(&self, connection: u64) -> bool {
        !self.closed && self.phase == SessionPhase::Open && self.connection == connection
    }

    /// Apply `event`, returning `(from, to)` when the phase changed.
    pub fn apply(&mut self, event: PhaseEvent) -> Option<(SessionPhase, SessionPhase)> {
        if self.closed {
            debug!(camera_id = %self.camera_id, ?event, "Ignoring event on closed session");
            return None;
        }

        let from = self.phase;
        match from.next(event) {
            Some(to) => {
                self.phase = to;
                if to == SessionPhase::Open {
                    self.connection += 1;
                }
                if event == PhaseEvent::CloseRequested {
                    self.closed = true;
                    self.latency.reset();
                }
                Some((from, to))
            }
            None => {
                debug!(
                    camera_id = %self.camera_id,
                    phase = %from,
                    ?event,
                    "Rejected invalid phase transition"
                );
                None
            }
        }
    }
}
