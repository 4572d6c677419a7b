//! Frame counter and virtualized clock readings exchanged at every boundary.

use crate::errors::ProtocolError;
use crate::wire::{Reader, Writer};

/// Plain seconds/nanoseconds pair, the shape both virtualized clocks use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Normalizing add; nanoseconds stay within `0..1_000_000_000`.
    pub fn add(self, other: TimeSpec) -> TimeSpec {
        let mut sec = self.sec + other.sec;
        let mut nsec = self.nsec + other.nsec;
        if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        TimeSpec { sec, nsec }
    }
}

/// Frame counter plus the two virtualized clocks, as of one frame boundary.
///
/// Mutated only by the runtime at a boundary; the controller overwrites it
/// wholesale after a successful state restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounterState {
    pub frame_count: u64,
    pub monotonic: TimeSpec,
    pub wall: TimeSpec,
}

impl FrameCounterState {
    pub const WIRE_SIZE: usize = 8 + 16 + 16;

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.put_u64(self.frame_count);
        w.put_i64(self.monotonic.sec);
        w.put_i64(self.monotonic.nsec);
        w.put_i64(self.wall.sec);
        w.put_i64(self.wall.nsec);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes, "FrameCounterState");
        let state = Self {
            frame_count: r.u64()?,
            monotonic: TimeSpec::new(r.i64()?, r.i64()?),
            wall: TimeSpec::new(r.i64()?, r.i64()?),
        };
        r.finish()?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_size_matches_encoding() {
        let state = FrameCounterState {
            frame_count: 42,
            monotonic: TimeSpec::new(1, 500),
            wall: TimeSpec::new(1_600_000_000, 999_999_999),
        };
        let bytes = state.encode();
        assert_eq!(bytes.len(), FrameCounterState::WIRE_SIZE);
        assert_eq!(FrameCounterState::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn timespec_add_carries_nanoseconds() {
        let a = TimeSpec::new(1, 900_000_000);
        let b = TimeSpec::new(0, 200_000_000);
        assert_eq!(a.add(b), TimeSpec::new(2, 100_000_000));
    }
}
