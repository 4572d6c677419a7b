//! The execution-affecting configuration snapshot.
//!
//! Owned by the controller and pushed wholesale whenever any field changes;
//! the runtime never originates changes to it. There is deliberately no
//! partial-field protocol: the structure is small and resending all of it
//! removes an entire class of desync bugs.

use crate::errors::ProtocolError;
use crate::wire::{Reader, Writer};

/// Whether and how the input stream is being recorded.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingMode {
    /// Live inputs, nothing written to the input log.
    #[default]
    Off = 0,
    /// Inputs are appended to the input log as frames run.
    Recording = 1,
    /// Inputs come from the input log; the log is read-only and reaching its
    /// end truncates the reported length to the current position.
    Playback = 2,
}

impl RecordingMode {
    fn from_wire(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            0 => Ok(Self::Off),
            1 => Ok(Self::Recording),
            2 => Ok(Self::Playback),
            _ => Err(ProtocolError::BadPayload("RecordingMode")),
        }
    }
}

/// Versioned, fixed-size snapshot of all execution-affecting settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedConfig {
    /// Layout version; bumped on any field change.
    pub version: u32,
    /// Whether the controller wants frames to advance at all.
    pub running: bool,
    /// Fast-forward: the runtime skips frame pacing sleeps.
    pub fast_forward: bool,
    /// Trace verbosity pushed to the runtime (0 = errors only .. 4 = trace).
    pub log_level: u8,
    pub recording: RecordingMode,
    /// Number of emulated controllers the target should see.
    pub controller_count: u8,
    /// Debug override: bypass all file virtualization and hit the real
    /// filesystem. Breaks determinism; for diagnosis only.
    pub native_fileio: bool,
    /// Frame pacing as a rational, frames per `framerate_den` seconds.
    pub framerate_num: u32,
    pub framerate_den: u32,
    /// Wall clock the target observes at frame zero. Also seeds synthetic
    /// file content and the randomness devices, so tweaking it reseeds any
    /// PRNG the target derives from those sources.
    pub initial_time_sec: i64,
    pub initial_time_nsec: i64,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            version: Self::VERSION,
            running: true,
            fast_forward: false,
            log_level: 2,
            recording: RecordingMode::Off,
            controller_count: 1,
            native_fileio: false,
            framerate_num: 60,
            framerate_den: 1,
            initial_time_sec: 1,
            initial_time_nsec: 0,
        }
    }
}

impl SharedConfig {
    pub const VERSION: u32 = 1;

    pub const WIRE_SIZE: usize = 4 + 6 + 4 + 4 + 8 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        w.put_u32(self.version);
        w.put_bool(self.running);
        w.put_bool(self.fast_forward);
        w.put_u8(self.log_level);
        w.put_u8(self.recording as u8);
        w.put_u8(self.controller_count);
        w.put_bool(self.native_fileio);
        w.put_u32(self.framerate_num);
        w.put_u32(self.framerate_den);
        w.put_i64(self.initial_time_sec);
        w.put_i64(self.initial_time_nsec);
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes, "SharedConfig");
        let version = r.u32()?;
        if version != Self::VERSION {
            return Err(ProtocolError::BadPayload("SharedConfig version"));
        }
        let config = Self {
            version,
            running: r.bool()?,
            fast_forward: r.bool()?,
            log_level: r.u8()?,
            recording: RecordingMode::from_wire(r.u8()?)?,
            controller_count: r.u8()?,
            native_fileio: r.bool()?,
            framerate_num: r.u32()?,
            framerate_den: r.u32()?,
            initial_time_sec: r.i64()?,
            initial_time_nsec: r.i64()?,
        };
        r.finish()?;
        Ok(config)
    }

    /// Seconds per frame as a (sec, nsec) pair, for the deterministic timer.
    pub fn frame_interval(&self) -> (i64, i64) {
        // den/num seconds per frame, split into whole + fractional nanos.
        let num = self.framerate_num.max(1) as i64;
        let den = self.framerate_den.max(1) as i64;
        let whole = den / num;
        let nanos = (den % num) * 1_000_000_000 / num;
        (whole, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let config = SharedConfig {
            running: true,
            fast_forward: true,
            log_level: 4,
            recording: RecordingMode::Playback,
            controller_count: 4,
            native_fileio: false,
            framerate_num: 30,
            framerate_den: 1,
            initial_time_sec: 1_600_000_000,
            initial_time_nsec: 50,
            ..Default::default()
        };
        let bytes = config.encode();
        assert_eq!(bytes.len(), SharedConfig::WIRE_SIZE);
        assert_eq!(SharedConfig::decode(&bytes).unwrap(), config);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut bytes = SharedConfig::default().encode();
        bytes[0] = 0xFF;
        assert!(SharedConfig::decode(&bytes).is_err());
    }

    #[test]
    fn frame_interval_60fps() {
        let config = SharedConfig::default();
        assert_eq!(config.frame_interval(), (0, 16_666_666));
    }

    #[test]
    fn frame_interval_slow_rational() {
        // 1 frame per 2 seconds.
        let config = SharedConfig {
            framerate_num: 1,
            framerate_den: 2,
            ..Default::default()
        };
        assert_eq!(config.frame_interval(), (2, 0));
    }
}
