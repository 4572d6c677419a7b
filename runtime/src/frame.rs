//! The runtime side of the frame-boundary protocol.
//!
//! Only the frame-driving thread calls in here. At every boundary the
//! runtime reports counters and `FrameEnd`, then blocks servicing controller
//! messages until `FrameStart` releases the target for exactly one more
//! frame. Other target threads keep running against the already-delivered
//! input and configuration state; the stores they read are lock-protected.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use framelock_logging::Log;
use framelock_protocol::{FrameCounterState, MessageId, ProtocolError, SharedConfig};

use crate::savestate::{self, StateImage};
use crate::{RuntimeContext, RuntimeError};

/// What the target should do after a boundary returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlow {
    /// Run one more frame, then call [`RuntimeContext::frame_boundary`]
    /// again.
    Continue,
    /// The session is over; the runtime has already torn down.
    Teardown,
}

impl RuntimeContext {
    /// Performs the initial handshake: identity out, then configuration,
    /// counters and patterns in, until the controller releases frame zero.
    pub fn handshake(&self) -> Result<FrameFlow, RuntimeError> {
        let pid = std::process::id();
        {
            let mut channel = self.channel();
            channel.send_with(MessageId::Pid, &pid.to_le_bytes())?;
            channel.send_str(MessageId::BuildId, self.build_id())?;
            channel.send(MessageId::HandshakeDone)?;
        }
        tracing::info!(target: Log::Core, pid, "runtime handshake sent");
        self.service_boundary()
    }

    /// One frame boundary: advance deterministic time, report, block until
    /// released. Returns [`FrameFlow::Teardown`] (after an orderly teardown)
    /// on quit or connection loss; protocol violations are returned as
    /// errors after the same teardown.
    pub fn frame_boundary(&self) -> Result<FrameFlow, RuntimeError> {
        let counters = self.timer().advance_frame();
        {
            let mut channel = self.channel();
            channel.send_with(MessageId::FrameCounters, &counters.encode())?;
            channel.send(MessageId::FrameEnd)?;
        }
        tracing::trace!(target: Log::Frame, frame = counters.frame_count, "frame end reported");
        let flow = self.service_boundary()?;
        if flow == FrameFlow::Continue {
            self.pace_frame();
        }
        Ok(flow)
    }

    /// Real-time frame pacing. Determinism comes entirely from the virtual
    /// clocks; this only shapes how fast wall time passes, and fast-forward
    /// skips it.
    fn pace_frame(&self) {
        let config = self.config();
        if config.fast_forward {
            *self.pacing() = None;
            return;
        }
        let (sec, nsec) = config.frame_interval();
        let interval = Duration::new(sec as u64, nsec as u32);

        let mut last = self.pacing();
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    /// Blocks servicing controller messages until `FrameStart`, a quit, or
    /// connection loss. The save/load command sequence (slot, path, command)
    /// happens entirely within one boundary, so its staging is local here.
    fn service_boundary(&self) -> Result<FrameFlow, RuntimeError> {
        let mut pending_slot: u32 = 0;
        let mut pending_path: Option<PathBuf> = None;

        loop {
            let id = {
                let mut channel = self.channel();
                channel.recv_id()?
            };
            match id {
                MessageId::ConfigPush => {
                    let payload = self.channel().recv_payload(id)?;
                    let config = SharedConfig::decode(&payload)?;
                    framelock_logging::set_verbosity(config.log_level);
                    self.set_config(config);
                    tracing::debug!(target: Log::Frame, "configuration adopted");
                },

                MessageId::InitialCounters => {
                    let payload = self.channel().recv_payload(id)?;
                    let counters = FrameCounterState::decode(&payload)?;
                    self.timer().restore(&counters);
                },

                MessageId::SavePattern => {
                    let pattern = self.channel().recv_str()?;
                    self.vfs().add_pattern(pattern);
                },

                MessageId::AllInputs => {
                    let payload = self.channel().recv_payload(id)?;
                    let next = framelock_protocol::InputSnapshot::decode(&payload)?;
                    let (previous, time_ms) = {
                        let mut inputs = self.inputs();
                        let previous = inputs.current;
                        inputs.advance(next);
                        let mono = self.timer().monotonic();
                        (previous, (mono.sec * 1_000 + mono.nsec / 1_000_000) as u32)
                    };
                    let mut devices = self.devices();
                    for emulator in devices.joysticks.values_mut() {
                        emulator.update(&previous, &next, time_ms);
                    }
                },

                MessageId::PreviewInputs => {
                    let payload = self.channel().recv_payload(id)?;
                    let preview = framelock_protocol::InputSnapshot::decode(&payload)?;
                    self.inputs().preview = preview;
                    // Heartbeat carries the unchanged counters; the frame
                    // counter provably does not advance while paused.
                    let counters = self.timer().counters();
                    let mut channel = self.channel();
                    channel.send_with(MessageId::Heartbeat, &counters.encode())?;
                },

                MessageId::MarkerText => {
                    let text = self.channel().recv_str()?;
                    self.set_marker(text);
                },

                MessageId::SaveSlot => {
                    let payload = self.channel().recv_payload(id)?;
                    pending_slot = u32::from_le_bytes(payload.try_into().map_err(|_| {
                        RuntimeError::Protocol(ProtocolError::BadPayload("SaveSlot"))
                    })?);
                },

                MessageId::StatePath => {
                    pending_path = Some(PathBuf::from(self.channel().recv_str()?));
                },

                MessageId::SaveState => {
                    let reply = match self.perform_save(pending_slot, pending_path.take()) {
                        Ok(()) => MessageId::SaveComplete,
                        Err(error) => {
                            tracing::error!(target: Log::SaveState, slot = pending_slot, %error, "save failed");
                            MessageId::SaveFailed
                        },
                    };
                    self.channel().send(reply)?;
                },

                MessageId::LoadState => {
                    match self.perform_load(pending_slot, pending_path.take()) {
                        Ok(counters) => {
                            let mut channel = self.channel();
                            channel.send(MessageId::LoadComplete)?;
                            // The controller resynchronizes on this report
                            // before resuming the per-frame exchange.
                            channel.send_with(MessageId::FrameCounters, &counters.encode())?;
                        },
                        Err(error) => {
                            // Current execution state is untouched.
                            tracing::error!(target: Log::SaveState, slot = pending_slot, %error, "load failed");
                            self.channel().send(MessageId::LoadFailed)?;
                        },
                    }
                },

                MessageId::FrameStart => {
                    return Ok(FrameFlow::Continue);
                },

                MessageId::UserQuit | MessageId::ConnectionLost => {
                    tracing::info!(target: Log::Core, reason = id.name(), "tearing down");
                    self.teardown();
                    return Ok(FrameFlow::Teardown);
                },

                other => {
                    // Known id, wrong direction or wrong state: as fatal as
                    // an unknown one.
                    self.teardown();
                    return Err(RuntimeError::Protocol(ProtocolError::UnexpectedMessage {
                        expected: "a frame-boundary message",
                        got: other.name(),
                    }));
                },
            }
        }
    }

    fn perform_save(&self, slot: u32, path: Option<PathBuf>) -> Result<(), RuntimeError> {
        let path = path.ok_or(RuntimeError::Protocol(ProtocolError::BadPayload("StatePath")))?;
        let image = StateImage {
            build_id: self.build_id().to_string(),
            counters: self.timer().counters(),
            store: self.vfs().snapshot()?,
            inputs: {
                let inputs = self.inputs();
                [inputs.current, inputs.previous]
            },
        };
        savestate::save(&path, &image)?;
        tracing::info!(target: Log::SaveState, slot, frame = image.counters.frame_count, "saved");
        Ok(())
    }

    /// Validates first, applies second: a failed load leaves every store
    /// untouched.
    fn perform_load(&self, slot: u32, path: Option<PathBuf>) -> Result<FrameCounterState, RuntimeError> {
        let path = path.ok_or(RuntimeError::Protocol(ProtocolError::BadPayload("StatePath")))?;
        let image = savestate::load(&path, self.build_id())?;

        self.vfs().restore(&image.store)?;
        self.timer().restore(&image.counters);
        {
            let mut inputs = self.inputs();
            inputs.current = image.inputs[0];
            inputs.previous = image.inputs[1];
        }
        tracing::info!(target: Log::SaveState, slot, frame = image.counters.frame_count, "loaded");
        Ok(image.counters)
    }

    /// Deterministic teardown: release the virtual store and close the
    /// channel so the peer observes the end of the session.
    pub fn teardown(&self) {
        self.vfs().teardown();
        self.channel().shutdown();
    }

    /// Surfaces a user-visible failure to the controller.
    pub fn alert(&self, text: &str) -> Result<(), RuntimeError> {
        self.channel().send_str(MessageId::Alert, text)?;
        Ok(())
    }

    /// Reports target metadata (title, engine, whatever the shim detects).
    pub fn send_game_info(&self, info: &str) -> Result<(), RuntimeError> {
        self.channel().send_str(MessageId::GameInfo, info)?;
        Ok(())
    }

    /// Announces that the target is exiting on its own. The controller
    /// decides whether that ends the session or becomes a UI event.
    pub fn announce_quit(&self) {
        let _ = self.channel().send(MessageId::Quit);
    }

    /// Asks the controller for a symbol address, blocking for the reply.
    /// Only valid while a frame is running, when the controller is draining
    /// runtime messages. A zero address means the controller has no mapping.
    pub fn query_symbol_address(&self, symbol: &str) -> Result<u64, RuntimeError> {
        let mut channel = self.channel();
        channel.send_str(MessageId::SymbolQuery, symbol)?;
        channel.expect(MessageId::SymbolAddress)?;
        let payload = channel.recv_payload(MessageId::SymbolAddress)?;
        let raw = payload
            .try_into()
            .map_err(|_| ProtocolError::BadPayload("SymbolAddress"))?;
        Ok(u64::from_le_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelock_protocol::Channel;
    use std::thread;

    fn test_context() -> (RuntimeContext, Channel) {
        let (a, b) = Channel::pair().unwrap();
        (RuntimeContext::new(a, "test-build"), b)
    }

    fn drive_frames(mut peer: Channel, frames: usize) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("driver".into())
            .spawn(move || {
                for _ in 0..frames {
                    peer.expect(MessageId::FrameCounters).unwrap();
                    peer.recv_payload(MessageId::FrameCounters).unwrap();
                    peer.expect(MessageId::FrameEnd).unwrap();
                    peer.send(MessageId::FrameStart).unwrap();
                }
            })
            .expect("thread spawn")
    }

    #[test]
    fn pacing_throttles_released_frames() {
        let (ctx, peer) = test_context();
        let mut config = ctx.config();
        // 20 fps, 50ms per frame.
        config.framerate_num = 20;
        config.framerate_den = 1;
        ctx.set_config(config);

        let driver = drive_frames(peer, 3);
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(ctx.frame_boundary().unwrap(), FrameFlow::Continue);
        }
        // The first boundary only sets the baseline; the next two each owe a
        // full interval.
        assert!(start.elapsed() >= Duration::from_millis(80));
        driver.join().unwrap();
    }

    #[test]
    fn fast_forward_skips_pacing() {
        let (ctx, peer) = test_context();
        let mut config = ctx.config();
        config.framerate_num = 20;
        config.framerate_den = 1;
        config.fast_forward = true;
        ctx.set_config(config);

        let driver = drive_frames(peer, 3);
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(ctx.frame_boundary().unwrap(), FrameFlow::Continue);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        driver.join().unwrap();
    }
}
