//! Target process launch.
//!
//! Binds the session's Unix socket, spawns the target with the shim library
//! preloaded and the socket path in its environment, and accepts exactly one
//! runtime connection. The socket file and the child are session-scoped:
//! both are cleaned up when the launcher drops.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

use framelock_logging::Log;
use framelock_protocol::{Channel, SOCKET_ENV_VAR};

use crate::errors::LaunchError;

/// Everything needed to start one target.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Target executable.
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// The built shim library to preload into the target.
    pub shim: PathBuf,
    /// Session socket path; stale files at it are replaced.
    pub socket: PathBuf,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, shim: impl Into<PathBuf>, socket: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            shim: shim.into(),
            socket: socket.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A spawned target and its session socket.
#[derive(Debug)]
pub struct Launcher {
    child: Child,
    socket: PathBuf,
    reaped: bool,
}

impl Launcher {
    /// Spawns the target and blocks until its runtime connects back.
    pub fn spawn(spec: &LaunchSpec) -> Result<(Launcher, Channel), LaunchError> {
        // A previous session may have left its socket file behind.
        let _ = fs::remove_file(&spec.socket);
        let listener = UnixListener::bind(&spec.socket).map_err(LaunchError::Socket)?;

        let child = Command::new(&spec.program)
            .args(&spec.args)
            .env("LD_PRELOAD", preload_value(&spec.shim))
            .env(SOCKET_ENV_VAR, &spec.socket)
            .stdin(Stdio::null())
            .spawn()
            .map_err(LaunchError::Spawn)?;
        tracing::info!(
            target: Log::Core,
            pid = child.id(),
            program = %spec.program.display(),
            "target spawned"
        );

        let (stream, _) = listener.accept().map_err(LaunchError::Accept)?;
        tracing::debug!(target: Log::Core, "runtime connected on session socket");

        let launcher = Launcher {
            child,
            socket: spec.socket.clone(),
            reaped: false,
        };
        Ok((launcher, Channel::new(stream)))
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Waits for the target to exit.
    pub fn reap(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        tracing::info!(target: Log::Core, %status, "target exited");
        Ok(status)
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
        let _ = fs::remove_file(&self.socket);
    }
}

/// Appends the shim to any preload list already in our environment, so a
/// wrapper that itself relies on LD_PRELOAD keeps working.
fn preload_value(shim: &Path) -> OsString {
    match std::env::var_os("LD_PRELOAD") {
        Some(existing) if !existing.is_empty() => {
            let mut value = OsString::from(shim);
            value.push(OsStr::new(":"));
            value.push(existing);
            value
        },
        _ => shim.as_os_str().to_owned(),
    }
}
