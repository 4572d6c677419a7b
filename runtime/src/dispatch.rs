//! Interception dispatch: the decision layer between a hooked libc entry
//! point and either a virtualized answer or the real implementation.
//!
//! Every hook follows the same contract:
//!
//! 1. Resolve (and cache forever) the real implementation, regardless of
//!    interception state.
//! 2. If the calling thread is `Native`, forward unconditionally with the
//!    original arguments.
//! 3. Classify: virtualized device node, synthetic path, save-data path, or
//!    none of those. Exactly one virtualization branch applies; everything
//!    else falls through to the real call (a miss is not an error).
//!
//! The raw-pointer signatures mirror the C entry points one-to-one so the
//! ffi layer stays a pure forwarder.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use framelock_logging::Log;
use libc::{mode_t, timespec};

use crate::guard;
use crate::interpose::real;
use crate::vfs::store::SYNTHETIC_UPTIME;
use crate::vfs::{joystick, urandom, CloseStatus, JoystickEmulator, UrandomEmulator};
use crate::RuntimeContext;

/// Opened by glibc's allocator; answering it must not allocate, so it is
/// special-cased before any logging or classification.
const ALLOCATOR_PROBE_PATH: &[u8] = b"/proc/sys/vm/overcommit_memory";

fn set_errno(err: c_int) {
    unsafe { *libc::__errno_location() = err };
}

impl RuntimeContext {
    /// Hook body for `open`/`open64`.
    ///
    /// # Safety
    /// `path` must be null or a valid C string; forwarded pointers obey the
    /// real call's contract.
    pub unsafe fn open_hook(&self, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let real_open = match real::OPEN.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() || path.is_null() {
            return unsafe { real_open(path, flags, mode) };
        }

        let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();

        // No allocation (logging included) may happen before this check.
        if bytes == ALLOCATOR_PROBE_PATH {
            return unsafe { real_open(path, flags, mode) };
        }

        tracing::trace!(
            target: Log::FileIO,
            path = %String::from_utf8_lossy(bytes),
            flags,
            "open"
        );

        let config = self.config();
        if config.native_fileio {
            return unsafe { real_open(path, flags, mode) };
        }

        let virt_path = Path::new(std::ffi::OsStr::from_bytes(bytes));

        // Device nodes are matched before the general save-file check.
        if urandom::is_random_device(virt_path) {
            let fd = unsafe { placeholder_fd(real_open) };
            if fd >= 0 {
                let emulator = UrandomEmulator::from_initial_time(config.initial_time_sec, config.initial_time_nsec);
                self.devices().random.insert(fd, emulator);
                tracing::debug!(target: Log::Device, fd, "emulating randomness device");
            }
            return fd;
        }

        if let Some(pad) = joystick::device_pad(virt_path) {
            if pad >= config.controller_count as usize {
                set_errno(libc::ENOENT);
                return -1;
            }
            let fd = unsafe { placeholder_fd(real_open) };
            if fd >= 0 {
                let (current, _) = self.input_pair();
                let mono = self.timer().monotonic();
                let time_ms = (mono.sec * 1_000 + mono.nsec / 1_000_000) as u32;
                self.devices().joysticks.insert(fd, JoystickEmulator::new(pad, &current, time_ms));
                tracing::debug!(target: Log::Device, fd, pad, "emulating joystick device");
            }
            return fd;
        }

        if virt_path.as_os_str() == SYNTHETIC_UPTIME {
            return self.open_uptime(virt_path, flags, &config);
        }

        if !guard::is_own_code() && self.vfs().is_virtualized(virt_path, flags) {
            return match self.vfs().open_virtual(virt_path, flags, None) {
                Ok(fd) => fd,
                Err(error) => {
                    set_errno(error.raw_os_error().unwrap_or(libc::EIO));
                    -1
                },
            };
        }

        unsafe { real_open(path, flags, mode) }
    }

    /// Synthetic `/proc/uptime`, seeded from the configured initial time so
    /// any PRNG seed a target derives from it is reproducible.
    fn open_uptime(&self, path: &Path, flags: c_int, config: &framelock_protocol::SharedConfig) -> c_int {
        let mut vfs = self.vfs();
        let seed = if vfs.is_open(path) {
            None
        } else {
            let sec = config.initial_time_sec;
            let centi = config.initial_time_nsec / 10_000_000;
            Some(format!("{sec}.{centi:02} {sec}.{centi:02}"))
        };
        match vfs.open_virtual(path, flags, seed.as_deref().map(str::as_bytes)) {
            Ok(fd) => fd,
            Err(error) => {
                set_errno(error.raw_os_error().unwrap_or(libc::EIO));
                -1
            },
        }
    }

    /// Hook body for `openat`/`openat64`. Absolute paths and `AT_FDCWD`
    /// resolve exactly like `open`, so they share its classification; a path
    /// relative to some other directory descriptor goes straight to the real
    /// call (virtualization is keyed on absolute paths).
    ///
    /// # Safety
    /// Same contract as [`Self::open_hook`].
    pub unsafe fn openat_hook(&self, dirfd: c_int, path: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let real_openat = match real::OPENAT.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() || path.is_null() {
            return unsafe { real_openat(dirfd, path, flags, mode) };
        }

        let absolute = unsafe { *path } == b'/' as c_char;
        if absolute || dirfd == libc::AT_FDCWD {
            return unsafe { self.open_hook(path, flags, mode) };
        }
        unsafe { real_openat(dirfd, path, flags, mode) }
    }

    /// Hook body for `close`.
    ///
    /// # Safety
    /// Plain descriptor argument; safe to call with anything.
    pub unsafe fn close_hook(&self, fd: c_int) -> c_int {
        let real_close = match real::CLOSE.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() {
            return unsafe { real_close(fd) };
        }

        {
            let mut devices = self.devices();
            if devices.random.remove(&fd).is_some() || devices.joysticks.remove(&fd).is_some() {
                return unsafe { real_close(fd) };
            }
        }

        match self.vfs().close_virtual(fd) {
            CloseStatus::Closed => 0,
            CloseStatus::NotVirtual => unsafe { real_close(fd) },
        }
    }

    /// Hook body for `read`: emulated devices answer here, everything else
    /// is the real read.
    ///
    /// # Safety
    /// `buf` must be valid for `count` bytes.
    pub unsafe fn read_hook(&self, fd: c_int, buf: *mut c_void, count: usize) -> isize {
        let real_read = match real::READ.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() || buf.is_null() {
            return unsafe { real_read(fd, buf, count) };
        }

        let slice = unsafe { std::slice::from_raw_parts_mut(buf as *mut u8, count) };

        let mut devices = self.devices();
        if let Some(emulator) = devices.random.get_mut(&fd) {
            emulator.fill(slice);
            return count as isize;
        }
        if let Some(emulator) = devices.joysticks.get_mut(&fd) {
            let n = emulator.read(slice);
            if n == 0 {
                // Event queue is empty; report as a non-blocking miss so the
                // target polls again next frame instead of blocking forever.
                set_errno(libc::EAGAIN);
                return -1;
            }
            return n as isize;
        }
        drop(devices);

        unsafe { real_read(fd, buf, count) }
    }

    /// Hook body for `access`.
    ///
    /// # Safety
    /// `path` must be null or a valid C string.
    pub unsafe fn access_hook(&self, path: *const c_char, amode: c_int) -> c_int {
        let real_access = match real::ACCESS.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() || path.is_null() {
            return unsafe { real_access(path, amode) };
        }

        let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
        let virt_path = Path::new(std::ffi::OsStr::from_bytes(bytes));

        match self.vfs().access_virtual(virt_path) {
            Some(true) => 0,
            Some(false) => {
                set_errno(libc::ENOENT);
                -1
            },
            None => unsafe { real_access(path, amode) },
        }
    }

    /// Hook body for `stat`.
    ///
    /// # Safety
    /// `path` must be null or a valid C string; `statbuf` must be valid for
    /// writes when the call succeeds.
    pub unsafe fn stat_hook(&self, path: *const c_char, statbuf: *mut libc::stat) -> c_int {
        let real_stat = match real::STAT.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() || path.is_null() || statbuf.is_null() {
            return unsafe { real_stat(path, statbuf) };
        }

        let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
        let virt_path = Path::new(std::ffi::OsStr::from_bytes(bytes));

        match self.vfs().stat_virtual(virt_path) {
            Some(virt) if virt.exists => {
                let st = unsafe { &mut *statbuf };
                *st = unsafe { std::mem::zeroed() };
                st.st_mode = libc::S_IFREG | 0o644;
                st.st_nlink = 1;
                st.st_size = virt.size;
                0
            },
            Some(_) => {
                set_errno(libc::ENOENT);
                -1
            },
            None => unsafe { real_stat(path, statbuf) },
        }
    }

    /// Hook body for `unlink`: a virtualized delete leaves the real
    /// filesystem alone but is visible to later existence checks.
    ///
    /// # Safety
    /// `path` must be null or a valid C string.
    pub unsafe fn unlink_hook(&self, path: *const c_char) -> c_int {
        let real_unlink = match real::UNLINK.get() {
            Ok(f) => f,
            Err(_) => {
                set_errno(libc::ENOSYS);
                return -1;
            },
        };

        if guard::is_native() || path.is_null() {
            return unsafe { real_unlink(path) };
        }

        let bytes = unsafe { CStr::from_ptr(path) }.to_bytes();
        let virt_path = Path::new(std::ffi::OsStr::from_bytes(bytes));

        if self.vfs().mark_removed(virt_path) {
            return 0;
        }
        unsafe { real_unlink(path) }
    }

    /// Hook body for `clock_gettime`: all clocks answer from the
    /// deterministic timer.
    ///
    /// # Safety
    /// `tp` must be valid for writes.
    pub unsafe fn clock_gettime_hook(&self, clockid: libc::clockid_t, tp: *mut timespec) -> c_int {
        if guard::is_native() || tp.is_null() {
            return match real::CLOCK_GETTIME.get() {
                Ok(f) => unsafe { f(clockid, tp) },
                Err(_) => {
                    set_errno(libc::ENOSYS);
                    -1
                },
            };
        }

        let timer = self.timer();
        let value = match clockid {
            libc::CLOCK_REALTIME | libc::CLOCK_REALTIME_COARSE => timer.wall(),
            _ => timer.monotonic(),
        };
        drop(timer);

        let out = unsafe { &mut *tp };
        out.tv_sec = value.sec;
        out.tv_nsec = value.nsec;
        0
    }
}

/// A real descriptor to hand out for an emulated device; reads on it are
/// serviced by the emulators, the kernel object behind it is never touched.
unsafe fn placeholder_fd(real_open: unsafe extern "C" fn(*const c_char, c_int, mode_t) -> c_int) -> c_int {
    let fd = unsafe { real_open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC, 0) };
    if fd < 0 {
        set_errno(libc::EIO);
    }
    fd
}
