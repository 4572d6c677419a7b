//! The process-wide registry of real system implementations.
//!
//! Every hooked symbol caches the address of the next definition in link
//! order (`dlsym(RTLD_NEXT, ..)`) exactly once, on first use, independent of
//! the interception state at the time. Hooks then call through the cached
//! pointer forever after; nothing is ever re-resolved per call.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::marker::PhantomData;
use std::sync::{Mutex, OnceLock};

use framelock_logging::Log;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterposeError {
    #[error("real symbol `{0}` not found")]
    SymbolNotFound(&'static str),
}

/// Names of symbols resolved so far, for diagnostics.
static RESOLVED: OnceLock<Mutex<Vec<&'static str>>> = OnceLock::new();

/// Snapshot of the resolved-symbol names (order of first use).
pub fn resolved_symbols() -> Vec<&'static str> {
    RESOLVED
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .map(|v| v.clone())
        .unwrap_or_default()
}

/// A lazily resolved pointer to the real implementation of one symbol.
///
/// `F` must be a plain `extern "C"` function pointer type; the cached address
/// is transmuted into it on access.
pub struct RealSymbol<F> {
    name: &'static CStr,
    slot: OnceLock<usize>,
    _marker: PhantomData<F>,
}

// The contained address is immutable after first set and the function
// pointers themselves are freely shareable.
unsafe impl<F> Sync for RealSymbol<F> {}
unsafe impl<F> Send for RealSymbol<F> {}

impl<F: Copy> RealSymbol<F> {
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            slot: OnceLock::new(),
            _marker: PhantomData,
        }
    }

    /// The real function, resolving it on first use.
    pub fn get(&self) -> Result<F, InterposeError> {
        const {
            assert!(std::mem::size_of::<F>() == std::mem::size_of::<usize>());
        }

        let addr = *self.slot.get_or_init(|| {
            let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) };
            if !addr.is_null() {
                if let Ok(mut resolved) = RESOLVED.get_or_init(|| Mutex::new(Vec::new())).lock() {
                    resolved.push(self.name_str());
                }
                tracing::trace!(target: Log::Core, symbol = self.name_str(), "resolved real symbol");
            }
            addr as usize
        });

        if addr == 0 {
            return Err(InterposeError::SymbolNotFound(self.name_str()));
        }
        // Size asserted above; fn pointer and usize share representation on
        // every platform this runs on.
        Ok(unsafe { std::mem::transmute_copy::<usize, F>(&addr) })
    }

    fn name_str(&self) -> &'static str {
        // Symbol names are ASCII literals.
        self.name.to_str().unwrap_or("<non-utf8>")
    }
}

/// Real implementations of every libc entry point the dispatch layer can
/// forward to.
pub mod real {
    use super::*;

    pub static OPEN: RealSymbol<unsafe extern "C" fn(*const c_char, c_int, libc::mode_t) -> c_int> =
        RealSymbol::new(c"open");

    pub static OPEN64: RealSymbol<unsafe extern "C" fn(*const c_char, c_int, libc::mode_t) -> c_int> =
        RealSymbol::new(c"open64");

    pub static OPENAT: RealSymbol<unsafe extern "C" fn(c_int, *const c_char, c_int, libc::mode_t) -> c_int> =
        RealSymbol::new(c"openat");

    pub static OPENAT64: RealSymbol<unsafe extern "C" fn(c_int, *const c_char, c_int, libc::mode_t) -> c_int> =
        RealSymbol::new(c"openat64");

    pub static CLOSE: RealSymbol<unsafe extern "C" fn(c_int) -> c_int> = RealSymbol::new(c"close");

    pub static READ: RealSymbol<unsafe extern "C" fn(c_int, *mut c_void, usize) -> isize> = RealSymbol::new(c"read");

    pub static ACCESS: RealSymbol<unsafe extern "C" fn(*const c_char, c_int) -> c_int> = RealSymbol::new(c"access");

    pub static STAT: RealSymbol<unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int> =
        RealSymbol::new(c"stat");

    pub static UNLINK: RealSymbol<unsafe extern "C" fn(*const c_char) -> c_int> = RealSymbol::new(c"unlink");

    pub static CLOCK_GETTIME: RealSymbol<unsafe extern "C" fn(libc::clockid_t, *mut libc::timespec) -> c_int> =
        RealSymbol::new(c"clock_gettime");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_real_symbol_once() {
        let first = real::CLOSE.get().unwrap();
        let second = real::CLOSE.get().unwrap();
        assert_eq!(first as usize, second as usize);
        assert!(resolved_symbols().contains(&"close"));
    }

    #[test]
    fn missing_symbol_reports_not_found() {
        static BOGUS: RealSymbol<unsafe extern "C" fn() -> c_int> = RealSymbol::new(c"framelock_no_such_symbol");
        assert!(matches!(BOGUS.get(), Err(InterposeError::SymbolNotFound(_))));
    }
}
