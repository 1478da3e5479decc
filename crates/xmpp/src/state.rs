//! Connection lifecycle state.
//!
//! The client keeps exactly one authoritative [`ConnectionState`] in an
//! atomic cell. All lifecycle operations move it with [`StateMachine::transition`],
//! a compare-and-set from a set of allowed sources. A failed transition never
//! mutates the cell, so callers can always report the state they observed.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::ClientError;

const UNINITIALIZED: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 1,
    Connected = 2,
    LoggingIn = 3,
    Securing = 4,
    LoggedIn = 5,
    Disconnecting = 6,
    Disconnected = 7,
}

impl ConnectionState {
    pub const ALL: [ConnectionState; 7] = [
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::LoggingIn,
        ConnectionState::Securing,
        ConnectionState::LoggedIn,
        ConnectionState::Disconnecting,
        ConnectionState::Disconnected,
    ];

    fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|state| *state as u8 == value)
    }

    /// States in which a transport is expected to be attached.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::LoggingIn
                | ConnectionState::Securing
                | ConnectionState::LoggedIn
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::LoggingIn => "LOGGING_IN",
            ConnectionState::Securing => "SECURING",
            ConnectionState::LoggedIn => "LOGGED_IN",
            ConnectionState::Disconnecting => "DISCONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub struct StateMachine {
    cell: AtomicU8,
}

impl StateMachine {
    /// Creates a machine in [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let machine = Self::uninitialized();
        let initialized = machine.transition(ConnectionState::Disconnected, &[]);
        debug_assert!(initialized.is_ok());
        machine
    }

    pub(crate) fn uninitialized() -> Self {
        Self {
            cell: AtomicU8::new(UNINITIALIZED),
        }
    }

    /// Current state, or `None` before the machine has been initialized.
    pub fn current(&self) -> Option<ConnectionState> {
        ConnectionState::from_u8(self.cell.load(Ordering::Acquire))
    }

    /// Moves to `target` if the current state is one of `allowed`.
    ///
    /// An empty `allowed` set only matches an uninitialized machine. Returns
    /// the previous state on success.
    pub fn transition(
        &self,
        target: ConnectionState,
        allowed: &[ConnectionState],
    ) -> Result<Option<ConnectionState>, ClientError> {
        loop {
            let raw = self.cell.load(Ordering::Acquire);
            let current = ConnectionState::from_u8(raw);

            let permitted = match current {
                None => allowed.is_empty(),
                Some(state) => allowed.contains(&state),
            };
            if !permitted {
                return Err(ClientError::InvalidState {
                    current,
                    expected: allowed.to_vec(),
                });
            }

            if self
                .cell
                .compare_exchange(raw, target as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    /// Unconditional store, reserved for terminal cleanup.
    pub(crate) fn force(&self, target: ConnectionState) {
        self.cell.store(target as u8, Ordering::Release);
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
