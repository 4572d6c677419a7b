//! Message identifiers and their payload shapes.
//!
//! Two disjoint id spaces: controller→runtime ids live in `100..`, the
//! runtime→controller ids in `200..`. Identifiers are stable integers; the
//! payload layout for each id is fixed (none, a fixed-size struct, or a
//! length-prefixed string) and recorded in [`MessageId::payload_kind`].
//!
//! Receiving an id outside the known set is a protocol error, never silently
//! skipped: with fixed-layout payloads there is no way to resynchronize the
//! stream past an unknown message.

use crate::config::SharedConfig;
use crate::counters::FrameCounterState;
use crate::errors::ProtocolError;
use crate::inputs::InputSnapshot;

/// Every message that can appear on the control channel, plus the
/// [`MessageId::ConnectionLost`] pseudo-id.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Never sent on the wire. Synthesized by the receive path when the peer
    /// closes or resets the connection, so state machines can handle loss of
    /// the peer exactly like a quit request instead of via an error branch.
    ConnectionLost = 0,

    // ---- controller → runtime ----
    /// Full [`SharedConfig`] snapshot. Always the whole structure.
    ConfigPush = 100,
    /// [`FrameCounterState`] to adopt (handshake, or after a restore).
    InitialCounters = 101,
    /// One save-data path pattern (string). Repeatable during the handshake.
    SavePattern = 102,
    /// The [`InputSnapshot`] for the frame about to run.
    AllInputs = 103,
    /// Input preview while paused (same payload as `AllInputs`).
    PreviewInputs = 104,
    /// On-screen marker text accompanying a preview (string).
    MarkerText = 105,
    /// Save-state slot id (u32). First step of a save/load command.
    SaveSlot = 106,
    /// Save-state storage path (string). Second step of a save/load command.
    StatePath = 107,
    /// Perform the save described by the preceding slot/path pair.
    SaveState = 108,
    /// Perform the load described by the preceding slot/path pair.
    LoadState = 109,
    /// Answer to a `SymbolQuery` (u64 address, 0 when unresolved).
    SymbolAddress = 110,
    /// Unblock the target for exactly one frame.
    FrameStart = 111,
    /// Orderly shutdown request.
    UserQuit = 112,

    // ---- runtime → controller ----
    /// Target process id (u32). First handshake message.
    Pid = 200,
    /// Build identity of the injected runtime (string).
    BuildId = 201,
    /// Handshake complete; the runtime is ready for config and counters.
    HandshakeDone = 202,
    /// [`FrameCounterState`] as of the boundary being reported.
    FrameCounters = 203,
    /// The frame has finished; the target is blocked awaiting `FrameStart`.
    FrameEnd = 204,
    /// Paused-idle heartbeat carrying unchanged [`FrameCounterState`].
    Heartbeat = 205,
    /// User-visible alert text (string), routed to the controller's UI.
    Alert = 206,
    /// Target metadata (string), e.g. detected engine/window title.
    GameInfo = 207,
    /// Ask the controller to resolve a symbol in the target binary (string).
    SymbolQuery = 208,
    /// Save command results.
    SaveComplete = 209,
    SaveFailed = 210,
    /// Load command results.
    LoadComplete = 211,
    LoadFailed = 212,
    /// The target is quitting of its own accord.
    Quit = 213,
}

/// Payload shape attached to a message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Identifier only.
    None,
    /// Fixed-size struct of exactly this many bytes.
    Fixed(usize),
    /// u32 length prefix followed by UTF-8 bytes.
    Str,
}

impl MessageId {
    /// Decodes a wire identifier, rejecting anything outside the known set.
    pub fn from_wire(raw: u32) -> Result<Self, ProtocolError> {
        use MessageId::*;
        Ok(match raw {
            100 => ConfigPush,
            101 => InitialCounters,
            102 => SavePattern,
            103 => AllInputs,
            104 => PreviewInputs,
            105 => MarkerText,
            106 => SaveSlot,
            107 => StatePath,
            108 => SaveState,
            109 => LoadState,
            110 => SymbolAddress,
            111 => FrameStart,
            112 => UserQuit,
            200 => Pid,
            201 => BuildId,
            202 => HandshakeDone,
            203 => FrameCounters,
            204 => FrameEnd,
            205 => Heartbeat,
            206 => Alert,
            207 => GameInfo,
            208 => SymbolQuery,
            209 => SaveComplete,
            210 => SaveFailed,
            211 => LoadComplete,
            212 => LoadFailed,
            213 => Quit,
            other => return Err(ProtocolError::UnknownMessage(other)),
        })
    }

    /// The single well-defined payload shape for this id.
    pub fn payload_kind(self) -> PayloadKind {
        use MessageId::*;
        match self {
            ConnectionLost => PayloadKind::None,

            ConfigPush => PayloadKind::Fixed(SharedConfig::WIRE_SIZE),
            InitialCounters | FrameCounters | Heartbeat => PayloadKind::Fixed(FrameCounterState::WIRE_SIZE),
            AllInputs | PreviewInputs => PayloadKind::Fixed(InputSnapshot::WIRE_SIZE),
            SaveSlot | Pid => PayloadKind::Fixed(4),
            SymbolAddress => PayloadKind::Fixed(8),

            SavePattern | MarkerText | StatePath | BuildId | Alert | GameInfo | SymbolQuery => PayloadKind::Str,

            SaveState | LoadState | FrameStart | UserQuit | HandshakeDone | FrameEnd | SaveComplete | SaveFailed
            | LoadComplete | LoadFailed | Quit => PayloadKind::None,
        }
    }

    /// Stable human-readable name, for logs and error text.
    pub fn name(self) -> &'static str {
        use MessageId::*;
        match self {
            ConnectionLost => "ConnectionLost",
            ConfigPush => "ConfigPush",
            InitialCounters => "InitialCounters",
            SavePattern => "SavePattern",
            AllInputs => "AllInputs",
            PreviewInputs => "PreviewInputs",
            MarkerText => "MarkerText",
            SaveSlot => "SaveSlot",
            StatePath => "StatePath",
            SaveState => "SaveState",
            LoadState => "LoadState",
            SymbolAddress => "SymbolAddress",
            FrameStart => "FrameStart",
            UserQuit => "UserQuit",
            Pid => "Pid",
            BuildId => "BuildId",
            HandshakeDone => "HandshakeDone",
            FrameCounters => "FrameCounters",
            FrameEnd => "FrameEnd",
            Heartbeat => "Heartbeat",
            Alert => "Alert",
            GameInfo => "GameInfo",
            SymbolQuery => "SymbolQuery",
            SaveComplete => "SaveComplete",
            SaveFailed => "SaveFailed",
            LoadComplete => "LoadComplete",
            LoadFailed => "LoadFailed",
            Quit => "Quit",
        }
    }
}
