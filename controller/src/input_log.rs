//! The ordered per-frame input log (the "movie").
//!
//! A plain list of [`InputSnapshot`] records, one per frame, with paired
//! begin/end change notifications so a front-end can mirror mutations
//! without any toolkit coupling here. On disk the log is a one-line JSON
//! header followed by fixed-size binary records.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

use framelock_logging::Log;
use framelock_protocol::InputSnapshot;
use serde::{Deserialize, Serialize};

use crate::errors::InputLogError;

const FORMAT_VERSION: u32 = 1;

/// Receives paired notifications around every mutation. `first..=last` are
/// frame indices; `will_change` always precedes the matching `changed`.
pub trait LogObserver: Send {
    fn range_will_change(&mut self, first: u64, last: u64);
    fn range_changed(&mut self, first: u64, last: u64);
}

#[derive(Debug, Serialize, Deserialize)]
struct LogHeader {
    version: u32,
    frame_count: u64,
    framerate_num: u32,
    framerate_den: u32,
}

/// The ordered input records plus registered observers.
#[derive(Default)]
pub struct InputLog {
    records: Vec<InputSnapshot>,
    observers: Vec<Box<dyn LogObserver>>,
    pub framerate_num: u32,
    pub framerate_den: u32,
}

impl InputLog {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            observers: Vec::new(),
            framerate_num: 60,
            framerate_den: 1,
        }
    }

    pub fn observe(&mut self, observer: Box<dyn LogObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> u64 {
        self.records.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The snapshot recorded for `frame`, if the log reaches that far.
    pub fn frame(&self, frame: u64) -> Option<&InputSnapshot> {
        self.records.get(frame as usize)
    }

    /// Appends one record.
    pub fn push(&mut self, snapshot: InputSnapshot) {
        let index = self.len();
        self.notify_will_change(index, index);
        self.records.push(snapshot);
        self.notify_changed(index, index);
    }

    /// Overwrites the record at `frame`, or appends when `frame` is exactly
    /// one past the end (the record-mode write position).
    pub fn set_frame(&mut self, frame: u64, snapshot: InputSnapshot) {
        if frame == self.len() {
            self.push(snapshot);
            return;
        }
        if (frame as usize) < self.records.len() {
            self.notify_will_change(frame, frame);
            self.records[frame as usize] = snapshot;
            self.notify_changed(frame, frame);
        }
    }

    /// Drops every record at `frame` and beyond. Reaching the end of the log
    /// in read-only playback lands here: the reported length becomes the
    /// current position instead of an error.
    pub fn truncate(&mut self, frame: u64) {
        if frame >= self.len() {
            return;
        }
        let last = self.len() - 1;
        self.notify_will_change(frame, last);
        self.records.truncate(frame as usize);
        self.notify_changed(frame, last);
        tracing::debug!(target: Log::Input, frames = self.len(), "input log truncated");
    }

    fn notify_will_change(&mut self, first: u64, last: u64) {
        for observer in &mut self.observers {
            observer.range_will_change(first, last);
        }
    }

    fn notify_changed(&mut self, first: u64, last: u64) {
        for observer in &mut self.observers {
            observer.range_changed(first, last);
        }
    }

    /// Writes the whole log to `path`, replacing whatever is there.
    pub fn save(&self, path: &Path) -> Result<(), InputLogError> {
        let header = LogHeader {
            version: FORMAT_VERSION,
            frame_count: self.len(),
            framerate_num: self.framerate_num,
            framerate_den: self.framerate_den,
        };
        let mut file = File::create(path)?;
        serde_json::to_writer(&mut file, &header)?;
        file.write_all(b"\n")?;
        for record in &self.records {
            file.write_all(&record.encode())?;
        }
        tracing::info!(target: Log::Input, path = %path.display(), frames = self.len(), "input log written");
        Ok(())
    }

    /// Reads a log written by [`InputLog::save`]. Observers do not survive
    /// the reload; the returned log has none registered.
    pub fn load(path: &Path) -> Result<Self, InputLogError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut header_line = String::new();
        reader.read_line(&mut header_line)?;
        let header: LogHeader = serde_json::from_str(header_line.trim_end())?;
        if header.version != FORMAT_VERSION {
            return Err(InputLogError::UnsupportedVersion(header.version));
        }

        let mut records = Vec::with_capacity(header.frame_count as usize);
        let mut buf = vec![0u8; InputSnapshot::WIRE_SIZE];
        for _ in 0..header.frame_count {
            reader.read_exact(&mut buf)?;
            records.push(InputSnapshot::decode(&buf)?);
        }
        tracing::info!(target: Log::Input, path = %path.display(), frames = records.len(), "input log read");
        Ok(Self {
            records,
            observers: Vec::new(),
            framerate_num: header.framerate_num,
            framerate_den: header.framerate_den,
        })
    }
}

impl std::fmt::Debug for InputLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputLog")
            .field("frames", &self.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Recorder {
        sender: mpsc::Sender<(&'static str, u64, u64)>,
    }

    impl LogObserver for Recorder {
        fn range_will_change(&mut self, first: u64, last: u64) {
            self.sender.send(("will", first, last)).unwrap();
        }

        fn range_changed(&mut self, first: u64, last: u64) {
            self.sender.send(("did", first, last)).unwrap();
        }
    }

    fn keyed(code: u32) -> InputSnapshot {
        let mut snap = InputSnapshot::default();
        snap.press_key(code);
        snap
    }

    #[test]
    fn push_and_set_notify_paired_ranges() {
        let (tx, rx) = mpsc::channel();
        let mut log = InputLog::new();
        log.observe(Box::new(Recorder { sender: tx }));

        log.push(keyed(1));
        log.set_frame(0, keyed(2));

        assert_eq!(rx.try_recv().unwrap(), ("will", 0, 0));
        assert_eq!(rx.try_recv().unwrap(), ("did", 0, 0));
        assert_eq!(rx.try_recv().unwrap(), ("will", 0, 0));
        assert_eq!(rx.try_recv().unwrap(), ("did", 0, 0));
        assert!(log.frame(0).unwrap().is_key_down(2));
    }

    #[test]
    fn set_one_past_end_appends() {
        let mut log = InputLog::new();
        log.set_frame(0, keyed(1));
        log.set_frame(1, keyed(2));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn truncate_notifies_the_dropped_range() {
        let (tx, rx) = mpsc::channel();
        let mut log = InputLog::new();
        for code in 1..=5 {
            log.push(keyed(code));
        }
        log.observe(Box::new(Recorder { sender: tx }));

        log.truncate(2);
        assert_eq!(log.len(), 2);
        assert_eq!(rx.try_recv().unwrap(), ("will", 2, 4));
        assert_eq!(rx.try_recv().unwrap(), ("did", 2, 4));

        // Truncating at or past the end is a no-op.
        log.truncate(10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disk_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.movie");

        let mut log = InputLog::new();
        log.framerate_num = 30;
        for code in [10, 20, 30] {
            log.push(keyed(code));
        }
        log.save(&path).unwrap();

        let loaded = InputLog::load(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.framerate_num, 30);
        assert!(loaded.frame(2).unwrap().is_key_down(30));
        assert!(loaded.frame(3).is_none());
    }

    #[test]
    fn garbage_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.movie");
        std::fs::write(&path, b"not json\n").unwrap();
        assert!(matches!(InputLog::load(&path), Err(InputLogError::BadHeader(_))));
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.movie");
        std::fs::write(
            &path,
            b"{\"version\":9,\"frame_count\":0,\"framerate_num\":60,\"framerate_den\":1}\n",
        )
        .unwrap();
        assert!(matches!(InputLog::load(&path), Err(InputLogError::UnsupportedVersion(9))));
    }
}
