//! The flat, fixed-shape input vector for one frame.
//!
//! Produced by the controller (recorded or live), consumed exactly once by
//! the runtime to answer input queries during that frame. The runtime keeps
//! a current/previous pair so edge-triggered events (press/release) can be
//! derived without asking the target anything.

use crate::errors::ProtocolError;
use crate::wire::{Reader, Writer};

/// Maximum number of simultaneously held keys we report.
pub const MAX_KEYS: usize = 16;

/// Controllers the runtime can expose to the target.
pub const MAX_CONTROLLERS: usize = 4;

/// Axes per controller (two sticks, two triggers, hat pair).
pub const AXES_PER_CONTROLLER: usize = 6;

/// Pointer position, button mask and accumulated wheel ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PointerState {
    pub x: i32,
    pub y: i32,
    pub buttons: u8,
    pub wheel: i8,
}

/// One controller's digital buttons (bitmask) and axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerState {
    pub buttons: u16,
    pub axes: [i16; AXES_PER_CONTROLLER],
}

/// The full deterministic input vector for one frame.
///
/// Held keys are raw keycodes in `keys[..]`, unused slots zero. Order within
/// the array is not meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputSnapshot {
    pub keys: [u32; MAX_KEYS],
    pub pointer: PointerState,
    pub controllers: [ControllerState; MAX_CONTROLLERS],
}

impl InputSnapshot {
    pub const WIRE_SIZE: usize = MAX_KEYS * 4 + (4 + 4 + 1 + 1) + MAX_CONTROLLERS * (2 + AXES_PER_CONTROLLER * 2);

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::with_capacity(Self::WIRE_SIZE);
        for key in self.keys {
            w.put_u32(key);
        }
        w.put_i32(self.pointer.x);
        w.put_i32(self.pointer.y);
        w.put_u8(self.pointer.buttons);
        w.put_i8(self.pointer.wheel);
        for pad in self.controllers {
            w.put_u16(pad.buttons);
            for axis in pad.axes {
                w.put_i16(axis);
            }
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(bytes, "InputSnapshot");
        let mut snapshot = Self::default();
        for key in snapshot.keys.iter_mut() {
            *key = r.u32()?;
        }
        snapshot.pointer = PointerState {
            x: r.i32()?,
            y: r.i32()?,
            buttons: r.u8()?,
            wheel: r.i8()?,
        };
        for pad in snapshot.controllers.iter_mut() {
            pad.buttons = r.u16()?;
            for axis in pad.axes.iter_mut() {
                *axis = r.i16()?;
            }
        }
        r.finish()?;
        Ok(snapshot)
    }

    /// Whether `keycode` is held this frame. Zero is never a valid keycode.
    pub fn is_key_down(&self, keycode: u32) -> bool {
        keycode != 0 && self.keys.contains(&keycode)
    }

    /// Registers `keycode` as held, if there is a free slot. Full snapshots
    /// drop further keys rather than growing (queue-limit policy).
    pub fn press_key(&mut self, keycode: u32) -> bool {
        if keycode == 0 || self.is_key_down(keycode) {
            return false;
        }
        match self.keys.iter_mut().find(|k| **k == 0) {
            Some(slot) => {
                *slot = keycode;
                true
            },
            None => false,
        }
    }

    /// Keys held now but not in `previous` (press edges).
    pub fn pressed_since(&self, previous: &InputSnapshot) -> impl Iterator<Item = u32> + '_ {
        let prev = *previous;
        self.keys
            .into_iter()
            .filter(move |&k| k != 0 && !prev.is_key_down(k))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Keys held in `previous` but not now (release edges).
    pub fn released_since(&self, previous: &InputSnapshot) -> impl Iterator<Item = u32> + '_ {
        let cur = *self;
        previous
            .keys
            .into_iter()
            .filter(move |&k| k != 0 && !cur.is_key_down(k))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Per-controller button edges versus `previous`: `(pressed, released)`
    /// bitmasks for controller `pad`.
    pub fn button_edges(&self, previous: &InputSnapshot, pad: usize) -> (u16, u16) {
        let now = self.controllers[pad].buttons;
        let before = previous.controllers[pad].buttons;
        (now & !before, before & !now)
    }
}
