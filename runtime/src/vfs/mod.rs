//! The virtualized resource layer.
//!
//! Selected paths and device nodes get a controller-visible backing store
//! instead of touching the real filesystem or real hardware, so target
//! execution is reproducible independent of host state:
//!
//! - [`store`] — save-data files and synthetic paths, backed by memfds.
//! - [`urandom`] — deterministic randomness device streams.
//! - [`joystick`] — deterministic joystick device nodes fed from the input
//!   snapshot pair.

pub mod joystick;
pub mod store;
pub mod urandom;

pub use joystick::{JoystickEmulator, JsEvent};
pub use store::{CloseStatus, StoreSnapshot, VirtStat, VirtualFileStore};
pub use urandom::UrandomEmulator;
