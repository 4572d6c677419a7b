//! Per-thread reentrancy state for intercepted entry points.
//!
//! A hook that itself issues real system calls must not be re-intercepted
//! and must not deadlock against itself. Each thread carries one of three
//! states:
//!
//! - `Intercepted` — normal target code; hooks apply their virtualization.
//! - `OwnCode` — runtime code that still wants device/synthetic handling
//!   but must not have its file accesses matched as save data.
//! - `Native` — forward everything unconditionally to the real
//!   implementation.
//!
//! States are expressed as nesting depth counters with RAII scopes so they
//! restore correctly on every exit path, early returns and unwinds included.
//! Different threads never observe each other's scopes.

use std::cell::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Intercepted,
    OwnCode,
    Native,
}

thread_local! {
    static NATIVE_DEPTH: Cell<u32> = const { Cell::new(0) };
    static OWN_CODE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// The current thread's interception state. `Native` wins over `OwnCode`.
pub fn current() -> ThreadState {
    if NATIVE_DEPTH.with(|d| d.get()) > 0 {
        ThreadState::Native
    } else if OWN_CODE_DEPTH.with(|d| d.get()) > 0 {
        ThreadState::OwnCode
    } else {
        ThreadState::Intercepted
    }
}

/// Hooks forward straight to the real implementation when this holds.
pub fn is_native() -> bool {
    NATIVE_DEPTH.with(|d| d.get()) > 0
}

/// Save-file matching is suppressed (devices still emulated) when this holds.
pub fn is_own_code() -> bool {
    OWN_CODE_DEPTH.with(|d| d.get()) > 0
}

/// While alive, every intercepted call from this thread goes to the real
/// implementation with original arguments.
#[must_use = "the guard only holds while the scope is alive"]
pub struct NativeScope;

impl NativeScope {
    pub fn enter() -> Self {
        NATIVE_DEPTH.with(|d| d.set(d.get() + 1));
        NativeScope
    }
}

impl Drop for NativeScope {
    fn drop(&mut self) {
        NATIVE_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// While alive, calls from this thread are treated as the runtime's own:
/// virtualized devices still answer, but save-file matching is skipped.
#[must_use = "the guard only holds while the scope is alive"]
pub struct OwnCodeScope;

impl OwnCodeScope {
    pub fn enter() -> Self {
        OWN_CODE_DEPTH.with(|d| d.set(d.get() + 1));
        OwnCodeScope
    }
}

impl Drop for OwnCodeScope {
    fn drop(&mut self) {
        OWN_CODE_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_is_intercepted() {
        assert_eq!(current(), ThreadState::Intercepted);
        assert!(!is_native());
        assert!(!is_own_code());
    }

    #[test]
    fn scopes_nest_and_restore() {
        {
            let _own = OwnCodeScope::enter();
            assert_eq!(current(), ThreadState::OwnCode);
            {
                let _native = NativeScope::enter();
                assert_eq!(current(), ThreadState::Native);
                {
                    let _native_again = NativeScope::enter();
                    assert_eq!(current(), ThreadState::Native);
                }
                assert_eq!(current(), ThreadState::Native);
            }
            assert_eq!(current(), ThreadState::OwnCode);
        }
        assert_eq!(current(), ThreadState::Intercepted);
    }

    #[test]
    fn scope_restores_across_panic() {
        let result = std::panic::catch_unwind(|| {
            let _native = NativeScope::enter();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(current(), ThreadState::Intercepted);
    }

    #[test]
    fn states_are_thread_scoped() {
        let _native = NativeScope::enter();
        let other = std::thread::spawn(|| current()).join().unwrap();
        assert_eq!(other, ThreadState::Intercepted);
    }
}
