//! The injected runtime core.
//!
//! This crate is everything that lives inside the target process: the
//! reentrancy guard and real-symbol registry that make interception safe,
//! the virtualized resource layer (files, randomness, device nodes, time),
//! the runtime side of the frame-boundary protocol, and the save-state
//! serializer. The `framelock-ffi` cdylib wraps this in `extern "C"` hook
//! symbols and a shim constructor; everything here is also directly
//! drivable in-process, which is how the integration tests exercise it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, RwLock};
use std::time::Instant;

use framelock_protocol::{Channel, InputSnapshot, SharedConfig};
use libc::c_int;

pub mod dispatch;
pub mod errors;
pub mod frame;
pub mod guard;
pub mod interpose;
pub mod savestate;
pub mod timer;
pub mod vfs;

pub use errors::RuntimeError;
pub use frame::FrameFlow;

use timer::DeterministicTimer;
use vfs::{JoystickEmulator, UrandomEmulator, VirtualFileStore};

/// The input double buffer plus the paused-preview slot.
#[derive(Debug, Default, Clone)]
pub struct InputBuffers {
    /// Consumed by input queries during the running frame.
    pub current: InputSnapshot,
    /// Last frame's snapshot, kept for edge-triggered events.
    pub previous: InputSnapshot,
    /// Most recent preview pushed while paused; display only.
    pub preview: InputSnapshot,
}

impl InputBuffers {
    /// Adopts the snapshot for the next frame, rotating current → previous.
    pub fn advance(&mut self, next: InputSnapshot) {
        self.previous = self.current;
        self.current = next;
    }
}

/// Emulated device descriptors currently handed out to the target.
#[derive(Debug, Default)]
pub struct DeviceTable {
    pub random: HashMap<c_int, UrandomEmulator>,
    pub joysticks: HashMap<c_int, JoystickEmulator>,
}

/// Shared state of the injected runtime.
///
/// One instance exists per session. Intercepted calls arrive on arbitrary
/// target threads, so every store sits behind its own lock; the channel is
/// only ever used by the frame-driving thread but is locked anyway to keep
/// the type freely shareable.
pub struct RuntimeContext {
    channel: Mutex<Channel>,
    config: RwLock<SharedConfig>,
    inputs: Mutex<InputBuffers>,
    vfs: Mutex<VirtualFileStore>,
    devices: Mutex<DeviceTable>,
    timer: Mutex<DeterministicTimer>,
    marker: Mutex<String>,
    /// Wall-clock instant of the last released frame, for pacing.
    pacing: Mutex<Option<Instant>>,
    build_id: String,
}

impl RuntimeContext {
    pub fn new(channel: Channel, build_id: impl Into<String>) -> Self {
        let config = SharedConfig::default();
        Self {
            channel: Mutex::new(channel),
            timer: Mutex::new(DeterministicTimer::new(&config)),
            config: RwLock::new(config),
            inputs: Mutex::new(InputBuffers::default()),
            vfs: Mutex::new(VirtualFileStore::new()),
            devices: Mutex::new(DeviceTable::default()),
            marker: Mutex::new(String::new()),
            pacing: Mutex::new(None),
            build_id: build_id.into(),
        }
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    /// The configuration as last pushed by the controller.
    pub fn config(&self) -> SharedConfig {
        *lock_read(&self.config)
    }

    /// The input snapshot pair for the running frame.
    pub fn input_pair(&self) -> (InputSnapshot, InputSnapshot) {
        let inputs = lock(&self.inputs);
        (inputs.current, inputs.previous)
    }

    /// Current marker text, as last pushed with a preview.
    pub fn marker(&self) -> String {
        lock(&self.marker).clone()
    }

    pub(crate) fn channel(&self) -> MutexGuard<'_, Channel> {
        lock(&self.channel)
    }

    pub(crate) fn vfs(&self) -> MutexGuard<'_, VirtualFileStore> {
        lock(&self.vfs)
    }

    pub(crate) fn devices(&self) -> MutexGuard<'_, DeviceTable> {
        lock(&self.devices)
    }

    pub(crate) fn timer(&self) -> MutexGuard<'_, DeterministicTimer> {
        lock(&self.timer)
    }

    pub(crate) fn inputs(&self) -> MutexGuard<'_, InputBuffers> {
        lock(&self.inputs)
    }

    pub(crate) fn pacing(&self) -> MutexGuard<'_, Option<Instant>> {
        lock(&self.pacing)
    }

    pub(crate) fn set_config(&self, new: SharedConfig) {
        *lock_write(&self.config) = new;
        self.timer().configure(&new);
    }

    pub(crate) fn set_marker(&self, text: String) {
        *lock(&self.marker) = text;
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext").field("build_id", &self.build_id).finish()
    }
}

/// The process-wide instance the preloaded hook symbols dispatch through.
static RUNTIME: OnceLock<RuntimeContext> = OnceLock::new();

/// Installs the session's context for the hook symbols. Returns it back if
/// one was already installed (which is a bug in the embedder).
pub fn install(context: RuntimeContext) -> Result<&'static RuntimeContext, RuntimeContext> {
    RUNTIME.set(context)?;
    Ok(RUNTIME.get().expect("set above"))
}

/// The installed context, if the shim has initialized.
pub fn instance() -> Option<&'static RuntimeContext> {
    RUNTIME.get()
}

// Mutex poisoning can only arise from a panic mid-critical-section; the
// stores stay structurally valid, so recover the guard rather than
// propagating panics into foreign frames.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_read<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_write<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
