//! Driver error types.

use {corral_factory::FactoryError, thiserror::Error};

use crate::{client::ClientError, session::SessionState};

/// Errors from session lifecycle operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Operation attempted on a terminated session. Programming error,
    /// always surfaced.
    #[error("session is closed")]
    SessionClosed,

    /// Operation attempted in a state that does not allow it.
    #[error("session in state {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Client(#[from] ClientError),

    /// Recording could not be started, stopped, or extracted.
    #[error("recording error: {0}")]
    Recording(String),
}
