//! Save-state serialization.
//!
//! The blob is an internal, versioned format: magic, format version, build
//! identity, frame counters, the full virtual-store snapshot and the input
//! double buffer. Identity is validated before anything is restored, so an
//! incompatible or corrupt blob can never leave execution half-modified.

use std::fs;
use std::path::Path;

use framelock_logging::Log;
use framelock_protocol::wire::{Reader, Writer};
use framelock_protocol::{FrameCounterState, InputSnapshot, ProtocolError};
use thiserror::Error;

use crate::guard::NativeScope;
use crate::vfs::StoreSnapshot;

const MAGIC: &[u8; 4] = b"FLSS";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("not a save-state file")]
    NotASaveState,

    #[error("unsupported save-state version {0}")]
    UnsupportedVersion(u32),

    #[error("save state was written by build `{found}`, this is `{expected}`")]
    IncompatibleBuild { expected: String, found: String },

    #[error("save state is corrupt: {0}")]
    Corrupt(#[from] ProtocolError),

    #[error("save-state i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the runtime core owns, as of one frame boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateImage {
    pub build_id: String,
    pub counters: FrameCounterState,
    pub store: StoreSnapshot,
    /// Current and previous input snapshots, in that order.
    pub inputs: [InputSnapshot; 2],
}

impl StateImage {
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(4096);
        w.put_bytes(MAGIC);
        w.put_u32(VERSION);
        w.put_blob(self.build_id.as_bytes());

        w.put_bytes(&self.counters.encode());

        w.put_u32(self.store.files.len() as u32);
        for (path, content) in &self.store.files {
            w.put_blob(path.to_string_lossy().as_bytes());
            w.put_blob(content);
        }
        w.put_u32(self.store.removed.len() as u32);
        for path in &self.store.removed {
            w.put_blob(path.to_string_lossy().as_bytes());
        }
        w.put_u32(self.store.offsets.len() as u32);
        for &(fd, offset) in &self.store.offsets {
            w.put_i32(fd);
            w.put_i64(offset);
        }
        w.put_u32(self.store.pipes.len() as u32);
        for (fd, pending) in &self.store.pipes {
            w.put_i32(*fd);
            w.put_blob(pending);
        }

        for snapshot in &self.inputs {
            w.put_bytes(&snapshot.encode());
        }
        w.into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, StateError> {
        let mut r = Reader::new(bytes, "StateImage");
        if r.bytes(4).map_err(|_| StateError::NotASaveState)? != MAGIC {
            return Err(StateError::NotASaveState);
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let build_id = String::from_utf8(r.blob()?.to_vec()).map_err(|_| StateError::NotASaveState)?;

        let counters = FrameCounterState::decode(r.bytes(FrameCounterState::WIRE_SIZE)?)?;

        let mut store = StoreSnapshot::default();
        for _ in 0..r.u32()? {
            let path = String::from_utf8_lossy(r.blob()?).into_owned().into();
            let content = r.blob()?.to_vec();
            store.files.push((path, content));
        }
        for _ in 0..r.u32()? {
            store.removed.push(String::from_utf8_lossy(r.blob()?).into_owned().into());
        }
        for _ in 0..r.u32()? {
            let fd = r.i32()?;
            let offset = r.i64()?;
            store.offsets.push((fd, offset));
        }
        for _ in 0..r.u32()? {
            let fd = r.i32()?;
            let pending = r.blob()?.to_vec();
            store.pipes.push((fd, pending));
        }

        let current = InputSnapshot::decode(r.bytes(InputSnapshot::WIRE_SIZE)?)?;
        let previous = InputSnapshot::decode(r.bytes(InputSnapshot::WIRE_SIZE)?)?;
        r.finish()?;

        Ok(Self {
            build_id,
            counters,
            store,
            inputs: [current, previous],
        })
    }
}

/// Writes the state image to `path`, replacing any previous blob there.
pub fn save(path: &Path, image: &StateImage) -> Result<(), StateError> {
    let _native = NativeScope::enter();
    let bytes = image.encode();
    fs::write(path, &bytes)?;
    tracing::info!(
        target: Log::SaveState,
        path = %path.display(),
        frame = image.counters.frame_count,
        bytes = bytes.len(),
        "state saved"
    );
    Ok(())
}

/// Reads and validates the blob at `path`. Nothing about current execution
/// is touched; callers apply the returned image only on success.
pub fn load(path: &Path, expected_build_id: &str) -> Result<StateImage, StateError> {
    let _native = NativeScope::enter();
    let bytes = fs::read(path)?;
    let image = StateImage::decode(&bytes)?;
    if image.build_id != expected_build_id {
        return Err(StateError::IncompatibleBuild {
            expected: expected_build_id.into(),
            found: image.build_id,
        });
    }
    tracing::info!(
        target: Log::SaveState,
        path = %path.display(),
        frame = image.counters.frame_count,
        "state loaded"
    );
    Ok(image)
}
