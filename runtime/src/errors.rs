use thiserror::Error;

use crate::interpose::InterposeError;
use crate::savestate::StateError;
use framelock_protocol::ProtocolError;

/// Failures surfaced by the injected runtime core.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Interpose(#[from] InterposeError),

    #[error("virtual store i/o failed: {0}")]
    Vfs(#[from] std::io::Error),
}
