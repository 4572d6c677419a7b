//! The wire contract between the controller process and the injected runtime.
//!
//! Everything both sides need to agree on lives here: the message identifier
//! spaces and their payload shapes ([`messages`]), the blocking channel that
//! carries them ([`channel`]), the execution-affecting configuration snapshot
//! ([`config`]), the frame counters ([`counters`]) and the flat per-frame
//! input vector ([`inputs`]).
//!
//! Payloads are fixed-layout little-endian binary, not a self-describing
//! format: the two sides are always built from the same tree, the structures
//! are small, and a fixed layout keeps the per-frame exchange allocation-free
//! on the hot path.

pub mod channel;
pub mod config;
pub mod counters;
pub mod errors;
pub mod inputs;
pub mod messages;
pub mod wire;

pub use channel::{Channel, SOCKET_ENV_VAR};
pub use config::{RecordingMode, SharedConfig};
pub use counters::{FrameCounterState, TimeSpec};
pub use errors::ProtocolError;
pub use inputs::{ControllerState, InputSnapshot, PointerState};
pub use messages::{MessageId, PayloadKind};
