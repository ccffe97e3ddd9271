use crate::{
    protocol,
    types::{ConnectionState, Mode, SessionSnapshot, TreadmillState},
};
use tracing::{debug, warn};

/// Outcome of feeding one notification to a [`Session`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    /// The payload was a full telemetry frame
    ///
    /// Only these frames are answered with a heartbeat or the pending command.
    pub decoded: bool,
    /// The observable snapshot changed
    pub changed: bool,
}

/// Connection and belt-mode lifecycle of one device session
///
/// Every transition reports whether the observable snapshot changed so the caller
/// can emit exactly one state-change event for it.
///
/// ```text
/// Disconnected --begin_connect--> Connecting
/// Connecting --connect_succeeded--> Connected(Stopped)
/// Connecting --connect_failed--> Disconnected
/// Connected --disconnected--> Disconnected (state reset)
/// Connected(mode) --apply_notification--> Connected(mode')
/// ```
#[derive(Debug, Default)]
pub struct Session {
    connection: ConnectionState,
    mode: Mode,
    state: TreadmillState,
}

impl Session {
    /// Create a disconnected session
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection lifecycle
    #[must_use]
    pub const fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Current belt mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Latest telemetry
    #[must_use]
    pub const fn state(&self) -> &TreadmillState {
        &self.state
    }

    /// Copy of everything an observer sees
    #[must_use]
    pub const fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection: self.connection,
            mode: self.mode,
            state: self.state,
        }
    }

    /// Enter `Connecting`
    ///
    /// Returns `false` and leaves the session untouched if a connection attempt is
    /// already in flight or the session is connected.
    pub fn begin_connect(&mut self) -> bool {
        if self.connection != ConnectionState::Disconnected {
            debug!("Ignoring connect request while {}", self.connection);
            return false;
        }
        self.connection = ConnectionState::Connecting;
        true
    }

    /// Handshake finished: connected with the belt stopped
    pub fn connect_succeeded(&mut self) -> bool {
        self.transition(|s| {
            if s.connection == ConnectionState::Connecting {
                s.connection = ConnectionState::Connected;
                s.mode = Mode::Stopped;
            }
        })
    }

    /// Handshake failed at some step: back to `Disconnected`
    pub fn connect_failed(&mut self) -> bool {
        self.transition(|s| {
            if s.connection == ConnectionState::Connecting {
                s.reset();
            }
        })
    }

    /// Platform reported the link as gone
    pub fn disconnected(&mut self) -> bool {
        self.transition(|s| {
            if s.connection == ConnectionState::Connected {
                s.reset();
            }
        })
    }

    /// Decode a telemetry notification into the session
    ///
    /// Short payloads reset the telemetry to defaults but keep the mode and the
    /// connection. Notifications outside a connected session are ignored.
    pub fn apply_notification(&mut self, data: &[u8]) -> Applied {
        if self.connection != ConnectionState::Connected {
            debug!("Dropping notification received while {}", self.connection);
            return Applied::default();
        }

        let mut decoded = false;
        let changed = self.transition(|s| match protocol::decode(data) {
            Ok(telemetry) => {
                decoded = true;
                s.mode = telemetry.mode;
                s.state = telemetry.state;
            }
            Err(e) => {
                warn!("{e}");
                s.state = TreadmillState::default();
            }
        });

        Applied { decoded, changed }
    }

    fn reset(&mut self) {
        self.connection = ConnectionState::Disconnected;
        self.mode = Mode::Disconnected;
        self.state = TreadmillState::default();
    }

    fn transition(&mut self, f: impl FnOnce(&mut Self)) -> bool {
        let before = self.snapshot();
        f(self);
        before != self.snapshot()
    }
}
