//! Connection state cell shared by the adapters

use std::sync::Mutex;

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::ConnectionState;

pub struct LifecycleCell {
    state: Mutex<ConnectionState>,
}

impl LifecycleCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `Connecting`. Returns `None` when already connected.
    ///
    /// The returned guard resets the state to `Disconnected` unless
    /// [`ConnectGuard::complete`] is called, so a failed or dropped connect
    /// never leaves the cell stuck in `Connecting`.
    pub fn begin_connect(&self) -> EngineResult<Option<ConnectGuard<'_>>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ConnectionState::Connecting => Err(EngineError::ConnectInProgress),
            ConnectionState::Connected => Ok(None),
            ConnectionState::Disconnected => {
                *state = ConnectionState::Connecting;
                Ok(Some(ConnectGuard {
                    cell: self,
                    completed: false,
                }))
            }
        }
    }

    pub fn set_disconnected(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Disconnected;
    }

    pub fn ensure_connected(&self) -> EngineResult<()> {
        match self.get() {
            ConnectionState::Connected => Ok(()),
            _ => Err(EngineError::NotConnected),
        }
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectGuard<'a> {
    cell: &'a LifecycleCell,
    completed: bool,
}

impl ConnectGuard<'_> {
    pub fn complete(mut self) {
        *self.cell.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Connected;
        self.completed = true;
    }
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.cell.set_disconnected();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_connect_fails_fast() {
        let cell = LifecycleCell::new();
        let guard = cell.begin_connect().expect("first").expect("guard");

        let err = cell.begin_connect().err().expect("second connect must fail");
        assert!(matches!(err, EngineError::ConnectInProgress));

        guard.complete();
        assert_eq!(cell.get(), ConnectionState::Connected);
        assert!(cell.begin_connect().expect("connected").is_none());
    }

    #[test]
    fn abandoned_connect_resets_state() {
        let cell = LifecycleCell::new();
        {
            let _guard = cell.begin_connect().expect("first");
            assert_eq!(cell.get(), ConnectionState::Connecting);
        }
        assert_eq!(cell.get(), ConnectionState::Disconnected);
        assert!(cell.ensure_connected().is_err());
    }
}
