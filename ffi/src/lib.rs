//! The `LD_PRELOAD` surface of the injected shim.
//!
//! This cdylib is what the launcher preloads into the target. It consists of
//! exactly two things: a constructor that connects back to the controller's
//! session socket and runs the handshake before the target's `main`, and the
//! exported C hook symbols that shadow the libc entry points and forward
//! into `framelock-runtime`'s dispatch layer.
//!
//! Every hook must behave exactly like the real call when the runtime is not
//! installed (no socket in the environment, or the handshake failed): a
//! target launched without a controller runs completely unmodified.

use std::ffi::{c_char, c_int, c_void};
use std::os::unix::net::UnixStream;

use framelock_logging::Log;
use framelock_protocol::{Channel, SOCKET_ENV_VAR};
use framelock_runtime::interpose::real;
use framelock_runtime::{instance, FrameFlow, RuntimeContext};

/// Build identity reported during the handshake and stamped into save
/// states. Two trees only interoperate when these match.
const BUILD_ID: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[used]
#[link_section = ".init_array"]
static SHIM_CONSTRUCTOR: extern "C" fn() = shim_init;

#[used]
#[link_section = ".fini_array"]
static SHIM_DESTRUCTOR: extern "C" fn() = shim_exit;

/// Runs before the target's `main`. Without the session socket variable the
/// shim stays inert and the target runs natively.
extern "C" fn shim_init() {
    let Some(socket) = std::env::var_os(SOCKET_ENV_VAR) else {
        return;
    };
    framelock_logging::init();

    let stream = match UnixStream::connect(&socket) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(target: Log::Core, %error, "could not reach the controller, running natively");
            return;
        },
    };

    let context = RuntimeContext::new(Channel::new(stream), BUILD_ID);
    let Ok(context) = framelock_runtime::install(context) else {
        tracing::error!(target: Log::Core, "shim constructor ran twice");
        return;
    };

    match context.handshake() {
        Ok(FrameFlow::Continue) => {
            tracing::info!(target: Log::Core, build = BUILD_ID, "session started");
        },
        Ok(FrameFlow::Teardown) => {
            tracing::info!(target: Log::Core, "controller ended the session before frame zero");
        },
        Err(error) => {
            tracing::error!(target: Log::Core, %error, "handshake failed, running natively");
        },
    }
}

extern "C" fn shim_exit() {
    if let Some(context) = instance() {
        context.announce_quit();
    }
}

/// Called by the target (directly, or from an interposed present/swap call)
/// once per rendered frame. Blocks until the controller releases the next
/// frame.
#[no_mangle]
pub extern "C" fn framelock_frame_boundary() {
    if let Some(context) = instance() {
        let _ = context.frame_boundary();
    }
}

fn fail_enosys() -> c_int {
    unsafe { *libc::__errno_location() = libc::ENOSYS };
    -1
}

#[no_mangle]
pub unsafe extern "C" fn open(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    match instance() {
        Some(context) => unsafe { context.open_hook(path, flags, mode) },
        None => match real::OPEN.get() {
            Ok(f) => unsafe { f(path, flags, mode) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn open64(path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    match instance() {
        // The dispatch layer is 64-bit clean; both entry points share it.
        Some(context) => unsafe { context.open_hook(path, flags, mode) },
        None => match real::OPEN64.get() {
            Ok(f) => unsafe { f(path, flags, mode) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat(dirfd: c_int, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    match instance() {
        Some(context) => unsafe { context.openat_hook(dirfd, path, flags, mode) },
        None => match real::OPENAT.get() {
            Ok(f) => unsafe { f(dirfd, path, flags, mode) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn openat64(dirfd: c_int, path: *const c_char, flags: c_int, mode: libc::mode_t) -> c_int {
    match instance() {
        Some(context) => unsafe { context.openat_hook(dirfd, path, flags, mode) },
        None => match real::OPENAT64.get() {
            Ok(f) => unsafe { f(dirfd, path, flags, mode) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    match instance() {
        Some(context) => unsafe { context.close_hook(fd) },
        None => match real::CLOSE.get() {
            Ok(f) => unsafe { f(fd) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: usize) -> isize {
    match instance() {
        Some(context) => unsafe { context.read_hook(fd, buf, count) },
        None => match real::READ.get() {
            Ok(f) => unsafe { f(fd, buf, count) },
            Err(_) => fail_enosys() as isize,
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn access(path: *const c_char, amode: c_int) -> c_int {
    match instance() {
        Some(context) => unsafe { context.access_hook(path, amode) },
        None => match real::ACCESS.get() {
            Ok(f) => unsafe { f(path, amode) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn stat(path: *const c_char, statbuf: *mut libc::stat) -> c_int {
    match instance() {
        Some(context) => unsafe { context.stat_hook(path, statbuf) },
        None => match real::STAT.get() {
            Ok(f) => unsafe { f(path, statbuf) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn unlink(path: *const c_char) -> c_int {
    match instance() {
        Some(context) => unsafe { context.unlink_hook(path) },
        None => match real::UNLINK.get() {
            Ok(f) => unsafe { f(path) },
            Err(_) => fail_enosys(),
        },
    }
}

#[no_mangle]
pub unsafe extern "C" fn clock_gettime(clockid: libc::clockid_t, tp: *mut libc::timespec) -> c_int {
    match instance() {
        Some(context) => unsafe { context.clock_gettime_hook(clockid, tp) },
        None => match real::CLOCK_GETTIME.get() {
            Ok(f) => unsafe { f(clockid, tp) },
            Err(_) => fail_enosys(),
        },
    }
}
