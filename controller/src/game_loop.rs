//! The frame-boundary state machine.
//!
//! The controller owns the pace: every frame the target runs happens because
//! this loop released it. One full cycle is `release_frame` (deliver config
//! if dirty, run any queued state operation, supply the next input snapshot,
//! send `FrameStart`) followed by `await_frame_end` (drain runtime messages
//! until `FrameEnd`). Between the two the target is blocked, which is where
//! pause-time interactions (previews, markers, queued saves) live.
//!
//! Anything a front-end would display is emitted as a plain event on an
//! `mpsc` channel; there is no toolkit coupling here.

use std::collections::HashMap;
use std::sync::mpsc;

use framelock_logging::Log;
use framelock_protocol::{
    Channel, FrameCounterState, InputSnapshot, MessageId, ProtocolError, RecordingMode, SharedConfig,
};

use crate::errors::LoopError;
use crate::input_log::InputLog;
use crate::savestates::SlotTable;

/// Where the loop is in the frame-boundary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the runtime's identity messages.
    AwaitingHandshake,
    /// A frame is in flight; draining runtime messages until `FrameEnd`.
    AwaitingFrameEnd,
    /// The target is blocked at a boundary, waiting for `FrameStart`.
    AwaitingFrameStart,
    /// The session is over.
    Exiting,
}

/// Notifications for a front-end, free of any toolkit types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Alert(String),
    GameInfo(String),
    FrameAdvanced(FrameCounterState),
    StatusChanged(LoopState),
    /// Read-only playback reached the end of the input log; the log length
    /// now equals the reported frame count.
    MovieEnded { frames: u64 },
    /// The target announced it is exiting on its own.
    TargetQuit,
}

/// A state operation queued from the front-end, run at the next boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StateOp {
    Save(usize),
    Load(usize),
}

/// The controller's copy of [`SharedConfig`] plus the dirty flag.
///
/// Every mutation marks the config dirty; the flag clears only after a
/// successful push, so a failed send retries at the next boundary.
#[derive(Debug)]
pub struct ConfigHandle {
    config: SharedConfig,
    dirty: bool,
}

impl ConfigHandle {
    pub fn new(config: SharedConfig) -> Self {
        // Dirty from the start: the first push happens during the handshake.
        Self { config, dirty: true }
    }

    pub fn get(&self) -> SharedConfig {
        self.config
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mutates the config and marks it for delivery.
    pub fn update(&mut self, mutate: impl FnOnce(&mut SharedConfig)) {
        mutate(&mut self.config);
        self.dirty = true;
    }

    /// Pushes the full snapshot; the dirty flag clears only on success.
    pub fn push(&mut self, channel: &mut Channel) -> Result<(), ProtocolError> {
        channel.send_with(MessageId::ConfigPush, &self.config.encode())?;
        self.dirty = false;
        Ok(())
    }
}

/// The frame loop for one session.
pub struct GameLoop {
    channel: Channel,
    state: LoopState,
    config: ConfigHandle,
    inputs: InputLog,
    slots: SlotTable,
    events: mpsc::Sender<UiEvent>,
    symbols: HashMap<String, u64>,

    /// Snapshot to deliver next frame when not in playback.
    next_input: InputSnapshot,
    /// Frame index of the next snapshot to deliver.
    position: u64,
    counters: FrameCounterState,
    queued: Option<StateOp>,
    movie_ended: bool,
    /// Whether a front-end is attached. A target-initiated quit terminates
    /// the session immediately when it is not.
    interactive: bool,

    target_pid: Option<u32>,
    target_build: Option<String>,
}

impl GameLoop {
    pub fn new(
        channel: Channel,
        config: SharedConfig,
        inputs: InputLog,
        slots: SlotTable,
        events: mpsc::Sender<UiEvent>,
    ) -> Self {
        Self {
            channel,
            state: LoopState::AwaitingHandshake,
            config: ConfigHandle::new(config),
            inputs,
            slots,
            events,
            symbols: HashMap::new(),
            next_input: InputSnapshot::default(),
            position: 0,
            counters: FrameCounterState::default(),
            queued: None,
            movie_ended: false,
            interactive: false,
            target_pid: None,
            target_build: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn counters(&self) -> FrameCounterState {
        self.counters
    }

    /// Frame index of the next snapshot to be delivered.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn target_pid(&self) -> Option<u32> {
        self.target_pid
    }

    pub fn target_build(&self) -> Option<&str> {
        self.target_build.as_deref()
    }

    pub fn config(&mut self) -> &mut ConfigHandle {
        &mut self.config
    }

    pub fn input_log(&mut self) -> &mut InputLog {
        &mut self.inputs
    }

    /// Marks a front-end as attached; target-initiated quits then become
    /// [`UiEvent::TargetQuit`] instead of ending the session.
    pub fn set_interactive(&mut self, interactive: bool) {
        self.interactive = interactive;
    }

    /// Registers an address for runtime symbol queries.
    pub fn define_symbol(&mut self, name: impl Into<String>, address: u64) {
        self.symbols.insert(name.into(), address);
    }

    /// Snapshot to deliver at the next boundary when not in playback.
    pub fn set_next_input(&mut self, snapshot: InputSnapshot) {
        self.next_input = snapshot;
    }

    /// Queues a save into `slot` for the next boundary.
    pub fn queue_save(&mut self, slot: usize) {
        self.queued = Some(StateOp::Save(slot));
    }

    /// Queues a load from `slot` for the next boundary.
    pub fn queue_load(&mut self, slot: usize) {
        self.queued = Some(StateOp::Load(slot));
    }

    /// Receives the runtime's identity and delivers the session's initial
    /// state. A malformed handshake aborts startup. On success the target is
    /// blocked at frame zero's boundary.
    pub fn handshake(&mut self, save_patterns: &[String]) -> Result<(), LoopError> {
        if self.state != LoopState::AwaitingHandshake {
            return Err(LoopError::WrongState("AwaitingHandshake"));
        }

        self.channel.expect(MessageId::Pid)?;
        let payload = self.channel.recv_payload(MessageId::Pid)?;
        let pid = u32::from_le_bytes(
            payload
                .try_into()
                .map_err(|_| ProtocolError::BadPayload("Pid"))?,
        );
        self.channel.expect(MessageId::BuildId)?;
        let build = self.channel.recv_str()?;
        self.channel.expect(MessageId::HandshakeDone)?;
        tracing::info!(target: Log::Core, pid, build = %build, "runtime connected");

        self.target_pid = Some(pid);
        self.target_build = Some(build);

        self.config.push(&mut self.channel)?;
        self.channel
            .send_with(MessageId::InitialCounters, &self.counters.encode())?;
        for pattern in save_patterns {
            self.channel.send_str(MessageId::SavePattern, pattern)?;
        }

        self.enter(LoopState::AwaitingFrameStart);
        Ok(())
    }

    /// Releases the target for exactly one frame: config if dirty, queued
    /// state operation, the next input snapshot, then `FrameStart`.
    pub fn release_frame(&mut self) -> Result<(), LoopError> {
        if self.state != LoopState::AwaitingFrameStart {
            return Err(LoopError::WrongState("AwaitingFrameStart"));
        }

        if self.config.is_dirty() {
            self.config.push(&mut self.channel)?;
        }

        if let Some(op) = self.queued.take() {
            if let Err(error) = self.run_state_op(op) {
                if !error.is_recoverable() {
                    self.exit_now();
                    return Err(error);
                }
                self.emit(UiEvent::Alert(error.to_string()));
            }
        }

        let snapshot = self.next_frame_input();
        self.channel.send_with(MessageId::AllInputs, &snapshot.encode())?;
        self.position += 1;
        self.channel.send(MessageId::FrameStart)?;
        self.enter(LoopState::AwaitingFrameEnd);
        Ok(())
    }

    /// Drains runtime messages until `FrameEnd`. Unknown identifiers and a
    /// lost connection end the session; alerts, game info and symbol queries
    /// are handled inline.
    pub fn await_frame_end(&mut self) -> Result<LoopState, LoopError> {
        if self.state != LoopState::AwaitingFrameEnd {
            return Err(LoopError::WrongState("AwaitingFrameEnd"));
        }

        loop {
            let id = match self.channel.recv_id() {
                Ok(id) => id,
                Err(error) => {
                    self.exit_now();
                    return Err(error.into());
                },
            };
            match id {
                MessageId::FrameCounters => {
                    let payload = self.channel.recv_payload(id)?;
                    self.counters = FrameCounterState::decode(&payload)?;
                    self.emit(UiEvent::FrameAdvanced(self.counters));
                },

                MessageId::Alert => {
                    let text = self.channel.recv_str()?;
                    tracing::warn!(target: Log::Core, %text, "runtime alert");
                    self.emit(UiEvent::Alert(text));
                },

                MessageId::GameInfo => {
                    let info = self.channel.recv_str()?;
                    self.emit(UiEvent::GameInfo(info));
                },

                MessageId::SymbolQuery => {
                    let name = self.channel.recv_str()?;
                    let address = self.symbols.get(&name).copied().unwrap_or(0);
                    self.channel
                        .send_with(MessageId::SymbolAddress, &address.to_le_bytes())?;
                },

                MessageId::Heartbeat => {
                    // Stale pause-time reply; the counters are unchanged by
                    // contract, so nothing to adopt.
                    let _ = self.channel.recv_payload(id)?;
                },

                MessageId::Quit => {
                    if self.interactive {
                        self.emit(UiEvent::TargetQuit);
                    } else {
                        self.exit_now();
                        return Ok(LoopState::Exiting);
                    }
                },

                MessageId::FrameEnd => {
                    self.enter(LoopState::AwaitingFrameStart);
                    return Ok(LoopState::AwaitingFrameStart);
                },

                MessageId::ConnectionLost => {
                    tracing::info!(target: Log::Core, "runtime went away");
                    self.exit_now();
                    return Ok(LoopState::Exiting);
                },

                other => {
                    self.exit_now();
                    return Err(ProtocolError::UnexpectedMessage {
                        expected: "a runtime report",
                        got: other.name(),
                    }
                    .into());
                },
            }
        }
    }

    /// One full frame: release, then wait for the boundary report.
    ///
    /// While the config's `running` flag is off the target stays at its
    /// boundary and the staged input is heartbeated instead, so a front-end
    /// can call this unconditionally from its tick.
    pub fn advance(&mut self) -> Result<LoopState, LoopError> {
        if !self.config.get().running {
            let staged = self.next_input;
            self.counters = self.preview(&staged, None)?;
            return Ok(self.state);
        }
        self.release_frame()?;
        if self.state == LoopState::Exiting {
            return Ok(LoopState::Exiting);
        }
        self.await_frame_end()
    }

    /// Pause-time preview: pushes a marker and a candidate snapshot for
    /// display without advancing the frame. The heartbeat's counters come
    /// back unchanged.
    pub fn preview(&mut self, snapshot: &InputSnapshot, marker: Option<&str>) -> Result<FrameCounterState, LoopError> {
        if self.state != LoopState::AwaitingFrameStart {
            return Err(LoopError::WrongState("AwaitingFrameStart"));
        }
        if let Some(text) = marker {
            self.channel.send_str(MessageId::MarkerText, text)?;
        }
        self.channel.send_with(MessageId::PreviewInputs, &snapshot.encode())?;
        self.channel.expect(MessageId::Heartbeat)?;
        let payload = self.channel.recv_payload(MessageId::Heartbeat)?;
        let counters = FrameCounterState::decode(&payload)?;
        Ok(counters)
    }

    /// Ends the session from our side: `UserQuit`, then teardown.
    pub fn quit(&mut self) {
        if self.state != LoopState::Exiting {
            let _ = self.channel.send(MessageId::UserQuit);
            self.exit_now();
        }
    }

    fn run_state_op(&mut self, op: StateOp) -> Result<(), LoopError> {
        match op {
            StateOp::Save(slot) => self.slots.save(&mut self.channel, slot),
            StateOp::Load(slot) => {
                let counters = self.slots.load(&mut self.channel, slot)?;
                self.counters = counters;
                self.position = counters.frame_count;
                self.movie_ended = false;
                // Restored state may predate any config change; re-push the
                // full snapshot unconditionally.
                self.config.push(&mut self.channel)?;
                self.emit(UiEvent::FrameAdvanced(counters));
                Ok(())
            },
        }
    }

    /// The snapshot for the next frame, honoring the recording mode.
    fn next_frame_input(&mut self) -> InputSnapshot {
        match self.config.get().recording {
            RecordingMode::Playback => match self.inputs.frame(self.position) {
                Some(snapshot) => *snapshot,
                None => {
                    if !self.movie_ended {
                        self.movie_ended = true;
                        self.inputs.truncate(self.position);
                        self.emit(UiEvent::MovieEnded { frames: self.inputs.len() });
                        tracing::info!(target: Log::Input, frames = self.inputs.len(), "end of input log");
                    }
                    InputSnapshot::default()
                },
            },
            RecordingMode::Recording => {
                let snapshot = self.next_input;
                self.inputs.set_frame(self.position, snapshot);
                snapshot
            },
            RecordingMode::Off => self.next_input,
        }
    }

    fn enter(&mut self, state: LoopState) {
        if self.state != state {
            self.state = state;
            self.emit(UiEvent::StatusChanged(state));
        }
    }

    /// Closes the channel and deletes the session's backing files. The peer
    /// observes the shutdown as `ConnectionLost`.
    fn exit_now(&mut self) {
        self.channel.shutdown();
        self.slots.cleanup();
        self.enter(LoopState::Exiting);
    }

    fn emit(&self, event: UiEvent) {
        // A detached front-end is fine; events are best-effort.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for GameLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameLoop")
            .field("state", &self.state)
            .field("position", &self.position)
            .finish()
    }
}
