use thiserror::Error;

use framelock_protocol::ProtocolError;

/// Failures surfaced by the frame loop and its satellites.
///
/// Protocol violations and transport loss are fatal to the session; slot
/// misuse and rejected state operations are recoverable and become alerts.
#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    InputLog(#[from] InputLogError),

    #[error("slot {0} has never been saved to")]
    EmptySlot(usize),

    #[error("slot {0} is out of range")]
    BadSlot(usize),

    #[error("runtime rejected the save into slot {0}")]
    SaveRejected(usize),

    #[error("runtime rejected the load from slot {0}")]
    LoadRejected(usize),

    #[error("operation requires state {0}")]
    WrongState(&'static str),

    #[error("session i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl LoopError {
    /// Whether the session can continue after this failure. Rejected state
    /// operations leave execution untouched; everything else tears down.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LoopError::EmptySlot(_) | LoopError::BadSlot(_) | LoopError::SaveRejected(_) | LoopError::LoadRejected(_)
        )
    }
}

/// Failures reading or writing the on-disk input log.
#[derive(Debug, Error)]
pub enum InputLogError {
    #[error("input log header is invalid: {0}")]
    BadHeader(#[from] serde_json::Error),

    #[error("unsupported input log version {0}")]
    UnsupportedVersion(u32),

    #[error("input log records are corrupt: {0}")]
    Corrupt(#[from] ProtocolError),

    #[error("input log i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures launching the target process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("could not bind the session socket: {0}")]
    Socket(std::io::Error),

    #[error("could not spawn the target: {0}")]
    Spawn(std::io::Error),

    #[error("the runtime never connected: {0}")]
    Accept(std::io::Error),
}
