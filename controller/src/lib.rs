//! The controlling side of a session.
//!
//! The controller owns the truth: the configuration, the input log, the save
//! slots and the pace of execution. The target only ever runs because
//! [`GameLoop::release_frame`] let it, and everything the target observes
//! (inputs, time, virtualized files) was delivered over the session channel
//! first.
//!
//! A front-end attaches by consuming [`UiEvent`]s from the loop's `mpsc`
//! channel and calling the queueing methods between frames; nothing in this
//! crate depends on any UI toolkit.

pub mod errors;
pub mod game_loop;
pub mod input_log;
pub mod launcher;
pub mod savestates;

pub use errors::{InputLogError, LaunchError, LoopError};
pub use game_loop::{ConfigHandle, GameLoop, LoopState, UiEvent};
pub use input_log::{InputLog, LogObserver};
pub use launcher::{LaunchSpec, Launcher};
pub use savestates::{SlotTable, SLOT_COUNT};
