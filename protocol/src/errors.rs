use thiserror::Error;

/// Failures on the control channel.
///
/// Everything here is fatal to the session except where a caller explicitly
/// recovers; see the taxonomy notes on [`crate::channel::Channel`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message id {0}")]
    UnknownMessage(u32),

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("payload for {0} truncated or malformed")]
    BadPayload(&'static str),

    #[error("string payload of {0} bytes exceeds the {1} byte limit")]
    OversizedString(u32, u32),

    #[error("string payload is not valid UTF-8")]
    BadString,

    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),
}
