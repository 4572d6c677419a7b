//! Log target names and subscriber setup used by both the controller process
//! and the injected runtime.
//!
//! Everything logs through `tracing` with an explicit target so that a single
//! `FRAMELOCK_LOG` filter can dial individual subsystems up or down, e.g:
//!
//! ```text
//! FRAMELOCK_LOG=framelock::fileio=trace,framelock=info
//! ```

use std::sync::{Once, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Environment variable consulted for the log filter.
pub const LOG_ENV_VAR: &str = "FRAMELOCK_LOG";

/// Namespaced log targets.
///
/// These are just pass-through string constants grouped on a type for
/// discoverability; use them as `tracing::info!(target: Log::Socket, ...)`.
#[allow(non_upper_case_globals)]
pub struct Log;

#[allow(non_upper_case_globals)]
impl Log {
    /// Core lifecycle on either side (startup, handshake, teardown).
    pub const Core: &'static str = "framelock::core";

    /// Control-channel traffic.
    pub const Socket: &'static str = "framelock::socket";

    /// Intercepted file I/O and the virtual file store.
    pub const FileIO: &'static str = "framelock::fileio";

    /// Emulated device nodes (randomness, joysticks).
    pub const Device: &'static str = "framelock::device";

    /// Deterministic timer and virtualized time queries.
    pub const Time: &'static str = "framelock::time";

    /// Frame-boundary state machine, both sides.
    pub const Frame: &'static str = "framelock::frame";

    /// Save-state serialization and the slot handshake.
    pub const SaveState: &'static str = "framelock::savestate";

    /// Input snapshots and the input log.
    pub const Input: &'static str = "framelock::input";
}

static INIT: Once = Once::new();

/// Reload handle for the active filter; only set when the filter came from
/// the built-in default rather than an explicit [`LOG_ENV_VAR`].
static FILTER: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Installs the global `tracing` subscriber, reading the filter from
/// [`LOG_ENV_VAR`] and defaulting to `info`.
///
/// Safe to call more than once; only the first call does anything. The
/// injected runtime calls this from its constructor, the controller from its
/// entry point, and tests call it freely.
pub fn init() {
    INIT.call_once(|| {
        let env_set = std::env::var_os(LOG_ENV_VAR).is_some();
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
        let (filter, handle) = reload::Layer::new(filter);

        // `try_init` rather than `init`: the embedding process may have
        // installed its own subscriber already, and that's fine.
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .is_ok();

        if installed && !env_set {
            let _ = FILTER.set(handle);
        }
    });
}

/// Applies the verbosity pushed over the control channel (0 = errors only
/// .. 4 = trace). An explicit filter in [`LOG_ENV_VAR`] wins; this is then a
/// no-op.
pub fn set_verbosity(level: u8) {
    let Some(handle) = FILTER.get() else {
        return;
    };
    let directive = match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let _ = handle.reload(EnvFilter::new(directive));
}
