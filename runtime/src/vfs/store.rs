//! The virtualized file store.
//!
//! Each virtualized path is backed by an anonymous memfd that lives for the
//! whole session, so content survives close/reopen cycles and never touches
//! the real filesystem. Handles returned to the target are real OS
//! descriptors (fresh file descriptions over the same inode), which keeps
//! plain `read`/`write`/`lseek` working without interception.
//!
//! Consistency invariant: once a path is virtualized, every subsequent
//! operation on it (open, close, stat, access, unlink) within the session is
//! answered from here — the target must never observe the file as absent via
//! one call and present via another.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use framelock_logging::Log;
use libc::c_int;

use crate::guard::NativeScope;

/// Synthetic uptime path: opened by targets as a PRNG seed source, so we
/// fabricate its content from the configured initial time.
pub const SYNTHETIC_UPTIME: &str = "/proc/uptime";

/// Outcome of [`VirtualFileStore::close_virtual`]. `NotVirtual` is a
/// sentinel, not an error: the interception layer falls through to the real
/// close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Closed,
    NotVirtual,
}

/// What a virtualized `stat`/`access` should report for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtStat {
    pub exists: bool,
    pub size: i64,
}

/// One open descriptor redirected to the backing store.
#[derive(Debug, Clone)]
pub struct VirtualFileEntry {
    /// Path for file handles; `None` for the pipe variant.
    pub path: Option<PathBuf>,
    /// The descriptor(s) owned by this entry; `fds[1]` is -1 unless pipe.
    pub fds: [c_int; 2],
    /// Offset captured at snapshot time; -1 while live.
    pub backing_offset: i64,
    /// Size captured at snapshot time; -1 while live.
    pub backing_size: i64,
}

impl VirtualFileEntry {
    pub fn is_pipe(&self) -> bool {
        self.fds[1] != -1
    }
}

/// Serializable image of the whole store, embedded in save states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Backing content per virtualized path.
    pub files: Vec<(PathBuf, Vec<u8>)>,
    /// Paths currently marked removed.
    pub removed: Vec<PathBuf>,
    /// Live handle offsets, keyed by descriptor.
    pub offsets: Vec<(c_int, i64)>,
    /// Pending (unread) bytes per registered pipe, keyed by read end.
    pub pipes: Vec<(c_int, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct VirtualFileStore {
    /// Configured save-data patterns (`*` wildcard or plain suffix).
    patterns: Vec<String>,
    /// Session-lifetime backing memfd per virtualized path.
    backings: HashMap<PathBuf, c_int>,
    /// Open handles given out to the target.
    handles: HashMap<c_int, VirtualFileEntry>,
    /// Registered pipes, keyed by read end (write end as value).
    pipes: HashMap<c_int, c_int>,
    /// Virtual tombstones.
    removed: HashSet<PathBuf>,
}

impl VirtualFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_patterns(&mut self, patterns: Vec<String>) {
        self.patterns = patterns;
    }

    pub fn add_pattern(&mut self, pattern: String) {
        self.patterns.push(pattern);
    }

    /// Whether `path` belongs to the virtual store: a configured save-data
    /// pattern, a synthetic path, or a path already virtualized earlier in
    /// the session (patterns may change, prior virtualization does not).
    pub fn is_virtualized(&self, path: &Path, _flags: c_int) -> bool {
        if path.as_os_str() == SYNTHETIC_UPTIME {
            return true;
        }
        if self.backings.contains_key(path) || self.removed.contains(path) {
            return true;
        }
        self.matches_save_pattern(path)
    }

    /// Pattern match: one `*` splits into prefix/suffix; a pattern without
    /// `*` matches as a suffix (typical extension patterns like `.sav`).
    pub fn matches_save_pattern(&self, path: &Path) -> bool {
        let s = path.to_string_lossy();
        self.patterns.iter().any(|pattern| match pattern.split_once('*') {
            Some((prefix, suffix)) => {
                s.len() >= prefix.len() + suffix.len() && s.starts_with(prefix) && s.ends_with(suffix)
            },
            None => s.ends_with(pattern.as_str()),
        })
    }

    /// Whether `path` has a backing store already (open or not).
    pub fn is_open(&self, path: &Path) -> bool {
        self.backings.contains_key(path)
    }

    /// Opens (or creates) the virtual file at `path`, returning a fresh OS
    /// descriptor whose content is shared with every other handle on the
    /// same path.
    ///
    /// `seed` fills a newly created backing with deterministic synthetic
    /// content. A path marked removed fails with `ENOENT` unless the caller
    /// passes `O_CREAT`, which revives it empty.
    pub fn open_virtual(&mut self, path: &Path, flags: c_int, seed: Option<&[u8]>) -> io::Result<c_int> {
        let _native = NativeScope::enter();

        if self.removed.contains(path) {
            if flags & libc::O_CREAT == 0 {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            self.removed.remove(path);
            if let Some(&backing) = self.backings.get(path) {
                ftruncate(backing, 0)?;
            }
        }

        let backing = match self.backings.get(path) {
            Some(&fd) => fd,
            None => {
                let fd = create_memfd(path)?;
                if let Some(bytes) = seed {
                    pwrite_all(fd, bytes, 0)?;
                }
                self.backings.insert(path.to_path_buf(), fd);
                tracing::debug!(target: Log::FileIO, path = %path.display(), "created virtual backing");
                fd
            },
        };

        // Already-open semantics: O_TRUNC on an existing backing truncates
        // the shared content, same as it would a real file.
        if flags & libc::O_TRUNC != 0 {
            ftruncate(backing, 0)?;
        }

        let handle = reopen(backing, flags)?;
        self.handles.insert(
            handle,
            VirtualFileEntry {
                path: Some(path.to_path_buf()),
                fds: [handle, -1],
                backing_offset: -1,
                backing_size: -1,
            },
        );
        tracing::trace!(target: Log::FileIO, path = %path.display(), fd = handle, "opened virtual file");
        Ok(handle)
    }

    /// Tracks an already-created pipe pair so its pending contents ride
    /// along in save states. The pipe variant owns two descriptors and has
    /// no path.
    pub fn register_pipe(&mut self, fds: [c_int; 2]) {
        self.pipes.insert(fds[0], fds[1]);
        for fd in fds {
            self.handles.insert(
                fd,
                VirtualFileEntry {
                    path: None,
                    fds,
                    backing_offset: -1,
                    backing_size: -1,
                },
            );
        }
    }

    /// Releases one handle. The backing store stays for the session so the
    /// path remains consistently virtualized.
    pub fn close_virtual(&mut self, fd: c_int) -> CloseStatus {
        let Some(entry) = self.handles.remove(&fd) else {
            return CloseStatus::NotVirtual;
        };
        let _native = NativeScope::enter();
        unsafe { libc::close(fd) };
        if entry.is_pipe() {
            self.pipes.remove(&entry.fds[0]);
        }
        tracing::trace!(target: Log::FileIO, fd, "closed virtual handle");
        CloseStatus::Closed
    }

    /// A virtualized delete: visible to later `access`/`stat`/`open`, while
    /// the real filesystem is untouched. Returns whether the path belonged
    /// to the store at all (callers fall through to the real unlink when it
    /// did not).
    pub fn mark_removed(&mut self, path: &Path) -> bool {
        if !self.is_virtualized(path, 0) {
            return false;
        }
        self.removed.insert(path.to_path_buf());
        tracing::debug!(target: Log::FileIO, path = %path.display(), "virtual remove");
        true
    }

    pub fn is_removed(&self, path: &Path) -> bool {
        self.removed.contains(path)
    }

    /// Answers `stat`-class queries for paths the store owns. `None` means
    /// the path is not (yet) virtualized and the caller falls through to the
    /// real call.
    pub fn stat_virtual(&self, path: &Path) -> Option<VirtStat> {
        if self.removed.contains(path) {
            return Some(VirtStat { exists: false, size: 0 });
        }
        let &backing = self.backings.get(path)?;
        let _native = NativeScope::enter();
        let size = backing_size(backing).unwrap_or(0);
        Some(VirtStat { exists: true, size })
    }

    /// Answers `access`-class existence checks; same fall-through rule as
    /// [`Self::stat_virtual`].
    pub fn access_virtual(&self, path: &Path) -> Option<bool> {
        self.stat_virtual(path).map(|s| s.exists)
    }

    pub fn handle(&self, fd: c_int) -> Option<&VirtualFileEntry> {
        self.handles.get(&fd)
    }

    /// Captures the whole store for a save state: backing contents, the
    /// removed set, live handle offsets, and pending pipe bytes (drained and
    /// immediately re-queued so the running target is unaffected).
    pub fn snapshot(&mut self) -> io::Result<StoreSnapshot> {
        let _native = NativeScope::enter();
        let mut snapshot = StoreSnapshot::default();

        for (path, &backing) in &self.backings {
            let size = backing_size(backing)?;
            let mut content = vec![0u8; size as usize];
            pread_all(backing, &mut content, 0)?;
            snapshot.files.push((path.clone(), content));
        }
        snapshot.files.sort();

        snapshot.removed = self.removed.iter().cloned().collect();
        snapshot.removed.sort();

        for (&fd, entry) in &mut self.handles {
            if entry.is_pipe() {
                continue;
            }
            let offset = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
            if offset >= 0 {
                entry.backing_offset = offset;
                snapshot.offsets.push((fd, offset));
            }
        }
        snapshot.offsets.sort();

        for (&read_end, &write_end) in &self.pipes {
            let pending = drain_pipe(read_end)?;
            // Put the bytes straight back so the snapshot is side-effect
            // free for the running target.
            write_all(write_end, &pending)?;
            snapshot.pipes.push((read_end, pending));
        }
        snapshot.pipes.sort();

        Ok(snapshot)
    }

    /// Restores a previously captured snapshot. Paths virtualized after the
    /// snapshot are dropped; handle offsets are rewound for descriptors that
    /// still exist.
    pub fn restore(&mut self, snapshot: &StoreSnapshot) -> io::Result<()> {
        let _native = NativeScope::enter();

        let keep: HashSet<&PathBuf> = snapshot.files.iter().map(|(p, _)| p).collect();
        let stale: Vec<PathBuf> = self.backings.keys().filter(|p| !keep.contains(p)).cloned().collect();
        for path in stale {
            if let Some(backing) = self.backings.remove(&path) {
                unsafe { libc::close(backing) };
            }
            let orphans: Vec<c_int> = self
                .handles
                .iter()
                .filter(|(_, e)| e.path.as_ref() == Some(&path))
                .map(|(&fd, _)| fd)
                .collect();
            for fd in orphans {
                self.handles.remove(&fd);
                unsafe { libc::close(fd) };
            }
        }

        for (path, content) in &snapshot.files {
            let backing = match self.backings.get(path) {
                Some(&fd) => fd,
                None => {
                    let fd = create_memfd(path)?;
                    self.backings.insert(path.clone(), fd);
                    fd
                },
            };
            ftruncate(backing, 0)?;
            pwrite_all(backing, content, 0)?;
        }

        self.removed = snapshot.removed.iter().cloned().collect();

        for &(fd, offset) in &snapshot.offsets {
            if self.handles.contains_key(&fd) {
                unsafe { libc::lseek(fd, offset, libc::SEEK_SET) };
            }
        }

        for &(read_end, ref bytes) in &snapshot.pipes {
            if let Some(&write_end) = self.pipes.get(&read_end) {
                let _ = drain_pipe(read_end)?;
                write_all(write_end, bytes)?;
            }
        }

        tracing::debug!(target: Log::FileIO, files = snapshot.files.len(), "virtual store restored");
        Ok(())
    }

    /// Deterministic teardown: closes every handle and backing.
    pub fn teardown(&mut self) {
        let _native = NativeScope::enter();
        for (&fd, _) in &self.handles {
            unsafe { libc::close(fd) };
        }
        for (_, &backing) in &self.backings {
            unsafe { libc::close(backing) };
        }
        self.handles.clear();
        self.backings.clear();
        self.pipes.clear();
        self.removed.clear();
    }
}

impl Drop for VirtualFileStore {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn create_memfd(path: &Path) -> io::Result<c_int> {
    let name = path.file_name().map(|n| n.as_bytes().to_vec()).unwrap_or_default();
    let name = CString::new(name).unwrap_or_else(|_| CString::new("backing").unwrap());
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// A fresh file description over the same backing inode, so handles get
/// independent offsets but shared content. The caller's access mode is
/// preserved: an `O_RDONLY` open must not hand back a writable descriptor.
fn reopen(backing: c_int, flags: c_int) -> io::Result<c_int> {
    let path = CString::new(format!("/proc/self/fd/{backing}")).unwrap();
    let reopen_flags = (flags & libc::O_ACCMODE) | libc::O_CLOEXEC | (flags & libc::O_APPEND);
    let fd = unsafe { libc::open(path.as_ptr(), reopen_flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn ftruncate(fd: c_int, len: i64) -> io::Result<()> {
    if unsafe { libc::ftruncate(fd, len) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn backing_size(fd: c_int) -> io::Result<i64> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.st_size)
}

fn pwrite_all(fd: c_int, mut bytes: &[u8], mut offset: i64) -> io::Result<()> {
    while !bytes.is_empty() {
        let n = unsafe { libc::pwrite(fd, bytes.as_ptr() as *const _, bytes.len(), offset) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        bytes = &bytes[n as usize..];
        offset += n as i64;
    }
    Ok(())
}

fn pread_all(fd: c_int, mut buf: &mut [u8], mut offset: i64) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut _, buf.len(), offset) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n == 0 {
            break;
        }
        buf = &mut buf[n as usize..];
        offset += n as i64;
    }
    Ok(())
}

fn write_all(fd: c_int, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

fn drain_pipe(read_end: c_int) -> io::Result<Vec<u8>> {
    let mut avail: c_int = 0;
    if unsafe { libc::ioctl(read_end, libc::FIONREAD, &mut avail) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let mut buf = vec![0u8; avail.max(0) as usize];
    let mut read = 0usize;
    while read < buf.len() {
        let n = unsafe { libc::read(read_end, buf[read..].as_mut_ptr() as *mut _, buf.len() - read) };
        if n <= 0 {
            break;
        }
        read += n as usize;
    }
    buf.truncate(read);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fd(fd: c_int, bytes: &[u8]) {
        write_all(fd, bytes).unwrap();
    }

    fn read_fd(fd: c_int, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, len) };
        assert!(n >= 0);
        buf.truncate(n as usize);
        buf
    }

    fn store_with_sav_pattern() -> VirtualFileStore {
        let mut store = VirtualFileStore::new();
        store.set_patterns(vec![".sav".into()]);
        store
    }

    #[test]
    fn pattern_matching() {
        let mut store = VirtualFileStore::new();
        store.set_patterns(vec![".sav".into(), "/data/profiles/*.cfg".into()]);

        assert!(store.matches_save_pattern(Path::new("/game/slot0.sav")));
        assert!(store.matches_save_pattern(Path::new("/data/profiles/p1.cfg")));
        assert!(!store.matches_save_pattern(Path::new("/data/other/p1.cfg")));
        assert!(!store.matches_save_pattern(Path::new("/game/texture.png")));
    }

    #[test]
    fn two_handles_share_backing_content() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/slot0.sav");

        let a = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        let b = store.open_virtual(path, libc::O_RDWR, None).unwrap();
        assert_ne!(a, b);

        write_fd(a, b"hello");
        assert_eq!(read_fd(b, 16), b"hello");

        assert_eq!(store.close_virtual(a), CloseStatus::Closed);
        assert_eq!(store.close_virtual(b), CloseStatus::Closed);
    }

    #[test]
    fn content_survives_close_and_reopen() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/slot1.sav");

        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        write_fd(fd, b"persist");
        store.close_virtual(fd);

        let fd = store.open_virtual(path, libc::O_RDONLY, None).unwrap();
        assert_eq!(read_fd(fd, 16), b"persist");
        store.close_virtual(fd);
    }

    #[test]
    fn seeded_backing_reads_back() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/seeded.sav");

        let fd = store.open_virtual(path, libc::O_RDONLY, Some(b"seed bytes")).unwrap();
        assert_eq!(read_fd(fd, 16), b"seed bytes");
        store.close_virtual(fd);
    }

    #[test]
    fn read_only_handles_reject_writes() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/locked.sav");

        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        write_fd(fd, b"locked");
        store.close_virtual(fd);

        let fd = store.open_virtual(path, libc::O_RDONLY, None).unwrap();
        let n = unsafe { libc::write(fd, b"x".as_ptr() as *const _, 1) };
        assert_eq!(n, -1);
        assert_eq!(read_fd(fd, 16), b"locked");
        store.close_virtual(fd);
    }

    #[test]
    fn o_trunc_clears_existing_backing() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/slot2.sav");

        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        write_fd(fd, b"old data");
        store.close_virtual(fd);

        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_TRUNC, None).unwrap();
        assert_eq!(store.stat_virtual(path).unwrap().size, 0);
        store.close_virtual(fd);
    }

    #[test]
    fn close_of_foreign_fd_is_sentinel() {
        let mut store = VirtualFileStore::new();
        assert_eq!(store.close_virtual(999), CloseStatus::NotVirtual);
    }

    #[test]
    fn removed_paths_report_nonexistent_regardless_of_prior_open() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/slot3.sav");

        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        write_fd(fd, b"doomed");
        store.close_virtual(fd);

        assert!(store.mark_removed(path));
        assert!(store.is_removed(path));
        assert_eq!(store.access_virtual(path), Some(false));
        assert!(!store.stat_virtual(path).unwrap().exists);

        // Re-opening without O_CREAT fails like a real missing file.
        let err = store.open_virtual(path, libc::O_RDONLY, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        // O_CREAT revives it empty.
        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        assert!(!store.is_removed(path));
        assert_eq!(store.stat_virtual(path).unwrap().size, 0);
        store.close_virtual(fd);
    }

    #[test]
    fn unopened_unmatched_paths_fall_through() {
        let store = store_with_sav_pattern();
        assert!(store.stat_virtual(Path::new("/etc/hostname")).is_none());
        assert!(store.access_virtual(Path::new("/etc/hostname")).is_none());
    }

    #[test]
    fn synthetic_uptime_is_always_virtualized() {
        let store = VirtualFileStore::new();
        assert!(store.is_virtualized(Path::new(SYNTHETIC_UPTIME), libc::O_RDONLY));
    }

    #[test]
    fn snapshot_and_restore_roundtrip() {
        let mut store = store_with_sav_pattern();
        let path = Path::new("/game/slot4.sav");

        let fd = store.open_virtual(path, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        write_fd(fd, b"frame ten");
        let snapshot = store.snapshot().unwrap();

        // Mutate past the snapshot point.
        write_fd(fd, b" and more");
        store.mark_removed(Path::new("/game/late.sav"));

        store.restore(&snapshot).unwrap();
        assert_eq!(store.stat_virtual(path).unwrap().size, 9);
        let mut buf = vec![0u8; 9];
        pread_all(fd, &mut buf, 0).unwrap();
        assert_eq!(buf, b"frame ten");

        // Offset was rewound to its snapshot position (end of "frame ten").
        let offset = unsafe { libc::lseek(fd, 0, libc::SEEK_CUR) };
        assert_eq!(offset, 9);
        store.close_virtual(fd);
    }

    #[test]
    fn restore_drops_files_virtualized_after_snapshot() {
        let mut store = store_with_sav_pattern();
        let early = Path::new("/game/early.sav");
        let late = Path::new("/game/late.sav");

        let fd = store.open_virtual(early, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        store.close_virtual(fd);
        let snapshot = store.snapshot().unwrap();

        let fd = store.open_virtual(late, libc::O_RDWR | libc::O_CREAT, None).unwrap();
        store.close_virtual(fd);
        assert!(store.is_open(late));

        store.restore(&snapshot).unwrap();
        assert!(store.is_open(early));
        assert!(!store.is_open(late));
    }

    #[test]
    fn pipe_contents_ride_along_in_snapshots() {
        let mut store = VirtualFileStore::new();
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        store.register_pipe(fds);

        write_fd(fds[1], b"queued");
        let snapshot = store.snapshot().unwrap();

        // Snapshot must not have consumed the pending bytes.
        assert_eq!(read_fd(fds[0], 16), b"queued");

        // Restore re-queues them.
        store.restore(&snapshot).unwrap();
        assert_eq!(read_fd(fds[0], 16), b"queued");

        store.close_virtual(fds[0]);
        store.close_virtual(fds[1]);
    }
}
