//! Save slots and the controller side of the state handshake.
//!
//! A fixed array of slots, each mapping to one on-disk blob owned by this
//! session. The command sequence for either direction is slot, path, then
//! the command itself; the runtime answers with a completion message, and a
//! completed load is followed by a fresh counter report the controller must
//! adopt before resuming the per-frame exchange.

use std::fs;
use std::path::{Path, PathBuf};

use framelock_logging::Log;
use framelock_protocol::{Channel, FrameCounterState, MessageId};

use crate::errors::LoopError;

/// Number of save slots a session exposes.
pub const SLOT_COUNT: usize = 10;

/// The slot table for one session.
#[derive(Debug)]
pub struct SlotTable {
    dir: PathBuf,
    saved: [bool; SLOT_COUNT],
    last_saved: Option<usize>,
    last_loaded: Option<usize>,
}

impl SlotTable {
    /// `dir` holds this session's blobs; it must already exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            saved: [false; SLOT_COUNT],
            last_saved: None,
            last_loaded: None,
        }
    }

    pub fn last_saved(&self) -> Option<usize> {
        self.last_saved
    }

    pub fn last_loaded(&self) -> Option<usize> {
        self.last_loaded
    }

    /// Whether `slot` holds a state from this session.
    pub fn is_saved(&self, slot: usize) -> bool {
        slot < SLOT_COUNT && self.saved[slot]
    }

    fn path_for(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("slot{slot}.state"))
    }

    /// Runs the save handshake for `slot`. A rejection is recoverable: the
    /// runtime reported failure and kept running.
    pub fn save(&mut self, channel: &mut Channel, slot: usize) -> Result<(), LoopError> {
        if slot >= SLOT_COUNT {
            return Err(LoopError::BadSlot(slot));
        }
        let path = self.path_for(slot);
        send_target(channel, slot, &path)?;
        channel.send(MessageId::SaveState)?;

        match channel.recv_id()? {
            MessageId::SaveComplete => {
                self.saved[slot] = true;
                self.last_saved = Some(slot);
                tracing::info!(target: Log::SaveState, slot, "slot saved");
                Ok(())
            },
            MessageId::SaveFailed => Err(LoopError::SaveRejected(slot)),
            other => Err(framelock_protocol::ProtocolError::UnexpectedMessage {
                expected: "SaveComplete or SaveFailed",
                got: other.name(),
            }
            .into()),
        }
    }

    /// Runs the load handshake for `slot` and returns the counters the
    /// runtime reported after restoring. A never-saved slot fails before any
    /// message is sent; a rejection leaves execution untouched.
    pub fn load(&mut self, channel: &mut Channel, slot: usize) -> Result<FrameCounterState, LoopError> {
        if slot >= SLOT_COUNT {
            return Err(LoopError::BadSlot(slot));
        }
        if !self.saved[slot] {
            return Err(LoopError::EmptySlot(slot));
        }
        let path = self.path_for(slot);
        send_target(channel, slot, &path)?;
        channel.send(MessageId::LoadState)?;

        match channel.recv_id()? {
            MessageId::LoadComplete => {
                channel.expect(MessageId::FrameCounters)?;
                let payload = channel.recv_payload(MessageId::FrameCounters)?;
                let counters = FrameCounterState::decode(&payload)?;
                self.last_loaded = Some(slot);
                tracing::info!(target: Log::SaveState, slot, frame = counters.frame_count, "slot loaded");
                Ok(counters)
            },
            MessageId::LoadFailed => Err(LoopError::LoadRejected(slot)),
            other => Err(framelock_protocol::ProtocolError::UnexpectedMessage {
                expected: "LoadComplete or LoadFailed",
                got: other.name(),
            }
            .into()),
        }
    }

    /// Deletes this session's blobs. Called on exit; missing files are fine.
    pub fn cleanup(&mut self) {
        for slot in 0..SLOT_COUNT {
            if self.saved[slot] {
                let _ = fs::remove_file(self.path_for(slot));
                self.saved[slot] = false;
            }
        }
    }
}

fn send_target(channel: &mut Channel, slot: usize, path: &Path) -> Result<(), LoopError> {
    channel.send_with(MessageId::SaveSlot, &(slot as u32).to_le_bytes())?;
    channel.send_str(MessageId::StatePath, &path.to_string_lossy())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    // Scripted runtime side for one save or load exchange.
    fn expect_target(channel: &mut Channel, slot: u32) {
        channel.expect(MessageId::SaveSlot).unwrap();
        let payload = channel.recv_payload(MessageId::SaveSlot).unwrap();
        assert_eq!(u32::from_le_bytes(payload.try_into().unwrap()), slot);
        channel.expect(MessageId::StatePath).unwrap();
        let path = channel.recv_str().unwrap();
        assert!(path.ends_with(&format!("slot{slot}.state")));
    }

    #[test]
    fn save_handshake_marks_the_slot() {
        let (mut ours, mut theirs) = Channel::pair().unwrap();
        let peer = thread::Builder::new()
            .name("fake-runtime".into())
            .spawn(move || {
                expect_target(&mut theirs, 3);
                theirs.expect(MessageId::SaveState).unwrap();
                theirs.send(MessageId::SaveComplete).unwrap();
            })
            .expect("thread spawn");

        let mut slots = SlotTable::new("/tmp");
        slots.save(&mut ours, 3).unwrap();
        assert!(slots.is_saved(3));
        assert_eq!(slots.last_saved(), Some(3));
        peer.join().unwrap();
    }

    #[test]
    fn rejected_save_is_recoverable() {
        let (mut ours, mut theirs) = Channel::pair().unwrap();
        let peer = thread::Builder::new()
            .name("fake-runtime".into())
            .spawn(move || {
                expect_target(&mut theirs, 0);
                theirs.expect(MessageId::SaveState).unwrap();
                theirs.send(MessageId::SaveFailed).unwrap();
            })
            .expect("thread spawn");

        let mut slots = SlotTable::new("/tmp");
        let err = slots.save(&mut ours, 0).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!slots.is_saved(0));
        peer.join().unwrap();
    }

    #[test]
    fn loading_an_empty_slot_sends_nothing() {
        let (mut ours, theirs) = Channel::pair().unwrap();
        let mut slots = SlotTable::new("/tmp");

        let err = slots.load(&mut ours, 5).unwrap_err();
        assert!(matches!(err, LoopError::EmptySlot(5)));

        // The peer saw no traffic; dropping it now must not have consumed
        // anything.
        drop(theirs);
    }

    #[test]
    fn load_adopts_the_reported_counters() {
        let (mut ours, mut theirs) = Channel::pair().unwrap();
        let peer = thread::Builder::new()
            .name("fake-runtime".into())
            .spawn(move || {
                // First a save so the slot exists, then the load.
                expect_target(&mut theirs, 1);
                theirs.expect(MessageId::SaveState).unwrap();
                theirs.send(MessageId::SaveComplete).unwrap();

                expect_target(&mut theirs, 1);
                theirs.expect(MessageId::LoadState).unwrap();
                theirs.send(MessageId::LoadComplete).unwrap();
                let counters = FrameCounterState {
                    frame_count: 10,
                    ..Default::default()
                };
                theirs.send_with(MessageId::FrameCounters, &counters.encode()).unwrap();
            })
            .expect("thread spawn");

        let mut slots = SlotTable::new("/tmp");
        slots.save(&mut ours, 1).unwrap();
        let counters = slots.load(&mut ours, 1).unwrap();
        assert_eq!(counters.frame_count, 10);
        assert_eq!(slots.last_loaded(), Some(1));
        peer.join().unwrap();
    }

    #[test]
    fn out_of_range_slot_is_rejected_locally() {
        let (mut ours, _theirs) = Channel::pair().unwrap();
        let mut slots = SlotTable::new("/tmp");
        assert!(matches!(slots.save(&mut ours, SLOT_COUNT), Err(LoopError::BadSlot(_))));
    }
}
