//! The blocking, message-oriented control channel.
//!
//! One bidirectional Unix domain socket carries every exchange. All sends for
//! one logical message are identifier-then-payload with nothing interleaved
//! from the same side, and a message is atomic: the receive path reads the
//! declared payload in full (`read_exact`) or fails. There is no partial
//! message resumption and no timeout; liveness comes from the strict
//! send-then-block-on-receive pattern both sides follow.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use framelock_logging::Log;

use crate::errors::ProtocolError;
use crate::messages::{MessageId, PayloadKind};

/// Strings beyond this are rejected rather than buffered (queue-limit
/// policy: log and drop, never grow unbounded on peer input).
pub const MAX_STRING_LEN: u32 = 16 * 1024;

/// Environment variable the launcher sets to the session socket path; the
/// injected shim connects to it from its constructor.
pub const SOCKET_ENV_VAR: &str = "FRAMELOCK_SOCKET";

/// One endpoint of the control channel.
pub struct Channel {
    stream: UnixStream,
}

impl Channel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// A connected in-process pair, used by tests and by the launcher's
    /// self-checks.
    pub fn pair() -> std::io::Result<(Channel, Channel)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Channel::new(a), Channel::new(b)))
    }

    /// Sends a payload-less message.
    pub fn send(&mut self, id: MessageId) -> Result<(), ProtocolError> {
        debug_assert_eq!(id.payload_kind(), PayloadKind::None, "{} carries a payload", id.name());
        self.send_raw(id, &[])
    }

    /// Sends a message with its fixed-size payload.
    pub fn send_with(&mut self, id: MessageId, payload: &[u8]) -> Result<(), ProtocolError> {
        debug_assert!(
            matches!(id.payload_kind(), PayloadKind::Fixed(n) if n == payload.len()),
            "{} payload is {} bytes",
            id.name(),
            payload.len()
        );
        self.send_raw(id, payload)
    }

    /// Sends a message with a length-prefixed string payload.
    pub fn send_str(&mut self, id: MessageId, s: &str) -> Result<(), ProtocolError> {
        debug_assert_eq!(id.payload_kind(), PayloadKind::Str, "{} is not a string message", id.name());
        // Compare in usize: casting the length first would wrap for
        // pathologically large strings and let them through.
        if s.len() > MAX_STRING_LEN as usize {
            let reported = s.len().try_into().unwrap_or(u32::MAX);
            return Err(ProtocolError::OversizedString(reported, MAX_STRING_LEN));
        }
        let mut buf = Vec::with_capacity(4 + 4 + s.len());
        buf.extend_from_slice(&(id as u32).to_le_bytes());
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
        self.stream.write_all(&buf)?;
        Ok(())
    }

    fn send_raw(&mut self, id: MessageId, payload: &[u8]) -> Result<(), ProtocolError> {
        tracing::trace!(target: Log::Socket, id = id.name(), len = payload.len(), "send");
        // One write for id + payload so the kernel sees the message whole.
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(id as u32).to_le_bytes());
        buf.extend_from_slice(payload);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Blocks for the next message identifier.
    ///
    /// A closed or reset connection is reported as the distinguished
    /// [`MessageId::ConnectionLost`] pseudo-id rather than an error: the
    /// state machines handle it exactly like a quit request. An id outside
    /// the known set is a fatal [`ProtocolError::UnknownMessage`].
    pub fn recv_id(&mut self) -> Result<MessageId, ProtocolError> {
        let mut raw = [0u8; 4];
        match self.stream.read_exact(&mut raw) {
            Ok(()) => {},
            Err(e) if connection_lost(&e) => {
                tracing::debug!(target: Log::Socket, "peer closed the channel");
                return Ok(MessageId::ConnectionLost);
            },
            Err(e) => return Err(e.into()),
        }
        let id = MessageId::from_wire(u32::from_le_bytes(raw))?;
        tracing::trace!(target: Log::Socket, id = id.name(), "recv");
        Ok(id)
    }

    /// Reads the fixed-size payload declared for `id`.
    pub fn recv_payload(&mut self, id: MessageId) -> Result<Vec<u8>, ProtocolError> {
        let len = match id.payload_kind() {
            PayloadKind::Fixed(len) => len,
            _ => return Err(ProtocolError::BadPayload(id.name())),
        };
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a length-prefixed string payload.
    pub fn recv_str(&mut self) -> Result<String, ProtocolError> {
        let mut raw = [0u8; 4];
        self.stream.read_exact(&mut raw)?;
        let len = u32::from_le_bytes(raw);
        if len > MAX_STRING_LEN {
            tracing::warn!(target: Log::Socket, len, "rejecting oversized string payload");
            return Err(ProtocolError::OversizedString(len, MAX_STRING_LEN));
        }
        let mut buf = vec![0u8; len as usize];
        self.stream.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| ProtocolError::BadString)
    }

    /// Blocks for a specific message, failing on anything else.
    ///
    /// Used during the handshake and the save/load exchange where the
    /// protocol allows exactly one next message.
    pub fn expect(&mut self, expected: MessageId) -> Result<(), ProtocolError> {
        let got = self.recv_id()?;
        if got != expected {
            return Err(ProtocolError::UnexpectedMessage {
                expected: expected.name(),
                got: got.name(),
            });
        }
        Ok(())
    }

    /// Half-closes both directions; the peer observes `ConnectionLost`.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

fn connection_lost(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
    )
}
