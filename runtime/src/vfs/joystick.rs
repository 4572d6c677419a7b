//! Deterministic joystick device-node emulation.
//!
//! Opens of `/dev/input/jsN` are answered with a descriptor whose reads
//! produce kernel-compatible `js_event` records derived from the input
//! snapshot pair — press/release edges and axis motion computed by the
//! runtime, never by real hardware.

use std::collections::VecDeque;
use std::path::Path;

use framelock_logging::Log;
use framelock_protocol::inputs::{InputSnapshot, AXES_PER_CONTROLLER, MAX_CONTROLLERS};

pub const JS_EVENT_BUTTON: u8 = 0x01;
pub const JS_EVENT_AXIS: u8 = 0x02;
/// OR'd into events replayed to a fresh reader to describe current state.
pub const JS_EVENT_INIT: u8 = 0x80;

/// Queued events beyond this are dropped (and counted) rather than letting
/// a non-reading target grow the queue without bound.
pub const EVENT_QUEUE_LIMIT: usize = 1024;

/// Kernel joystick event layout (`linux/joystick.h`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsEvent {
    /// Milliseconds of virtualized monotonic time.
    pub time: u32,
    pub value: i16,
    pub kind: u8,
    pub number: u8,
}

impl JsEvent {
    pub const WIRE_SIZE: usize = 8;

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&self.time.to_le_bytes());
        out[4..6].copy_from_slice(&self.value.to_le_bytes());
        out[6] = self.kind;
        out[7] = self.number;
        out
    }
}

/// Which controller a joystick device path maps to, if any.
pub fn device_pad(path: &Path) -> Option<usize> {
    let s = path.to_str()?;
    let index: usize = s.strip_prefix("/dev/input/js")?.parse().ok()?;
    (index < MAX_CONTROLLERS).then_some(index)
}

/// Event source for one open joystick descriptor.
#[derive(Debug)]
pub struct JoystickEmulator {
    pad: usize,
    queue: VecDeque<JsEvent>,
    dropped: u64,
}

impl JoystickEmulator {
    /// A fresh reader first sees synthetic init events describing the
    /// controller's current state, like the kernel driver does.
    pub fn new(pad: usize, current: &InputSnapshot, time_ms: u32) -> Self {
        let mut emulator = Self {
            pad,
            queue: VecDeque::new(),
            dropped: 0,
        };
        let state = &current.controllers[pad];
        for button in 0..16u8 {
            emulator.push(JsEvent {
                time: time_ms,
                value: ((state.buttons >> button) & 1) as i16,
                kind: JS_EVENT_BUTTON | JS_EVENT_INIT,
                number: button,
            });
        }
        for axis in 0..AXES_PER_CONTROLLER as u8 {
            emulator.push(JsEvent {
                time: time_ms,
                value: state.axes[axis as usize],
                kind: JS_EVENT_AXIS | JS_EVENT_INIT,
                number: axis,
            });
        }
        emulator
    }

    pub fn pad(&self) -> usize {
        self.pad
    }

    /// Queues edge events for the snapshot transition at one frame boundary.
    pub fn update(&mut self, previous: &InputSnapshot, current: &InputSnapshot, time_ms: u32) {
        let (pressed, released) = current.button_edges(previous, self.pad);
        for button in 0..16u8 {
            let mask = 1u16 << button;
            if pressed & mask != 0 || released & mask != 0 {
                self.push(JsEvent {
                    time: time_ms,
                    value: (pressed & mask != 0) as i16,
                    kind: JS_EVENT_BUTTON,
                    number: button,
                });
            }
        }
        for axis in 0..AXES_PER_CONTROLLER {
            let now = current.controllers[self.pad].axes[axis];
            if now != previous.controllers[self.pad].axes[axis] {
                self.push(JsEvent {
                    time: time_ms,
                    value: now,
                    kind: JS_EVENT_AXIS,
                    number: axis as u8,
                });
            }
        }
    }

    fn push(&mut self, event: JsEvent) {
        if self.queue.len() >= EVENT_QUEUE_LIMIT {
            self.dropped += 1;
            if self.dropped == 1 || self.dropped.is_power_of_two() {
                tracing::warn!(target: Log::Device, pad = self.pad, dropped = self.dropped, "joystick queue full");
            }
            return;
        }
        self.queue.push_back(event);
    }

    /// Services a `read` on the emulated descriptor: whole events only,
    /// as many as fit. Returns bytes written; 0 means "would block".
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        while written + JsEvent::WIRE_SIZE <= buf.len() {
            let Some(event) = self.queue.pop_front() else {
                break;
            };
            buf[written..written + JsEvent::WIRE_SIZE].copy_from_slice(&event.to_bytes());
            written += JsEvent::WIRE_SIZE;
        }
        written
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_parsing() {
        assert_eq!(device_pad(Path::new("/dev/input/js0")), Some(0));
        assert_eq!(device_pad(Path::new("/dev/input/js3")), Some(3));
        assert_eq!(device_pad(Path::new("/dev/input/js9")), None);
        assert_eq!(device_pad(Path::new("/dev/input/event0")), None);
        assert_eq!(device_pad(Path::new("/dev/js0")), None);
    }

    #[test]
    fn fresh_reader_sees_init_state() {
        let mut snapshot = InputSnapshot::default();
        snapshot.controllers[0].buttons = 0b1;
        snapshot.controllers[0].axes[0] = 5_000;

        let mut emulator = JoystickEmulator::new(0, &snapshot, 0);
        let mut buf = [0u8; 512];
        let n = emulator.read(&mut buf);
        assert_eq!(n, (16 + AXES_PER_CONTROLLER) * JsEvent::WIRE_SIZE);

        // First event: button 0 held, flagged as init.
        assert_eq!(buf[6], JS_EVENT_BUTTON | JS_EVENT_INIT);
        assert_eq!(i16::from_le_bytes([buf[4], buf[5]]), 1);
    }

    #[test]
    fn edges_produce_events() {
        let previous = InputSnapshot::default();
        let mut current = InputSnapshot::default();
        current.controllers[1].buttons = 0b10;
        current.controllers[1].axes[2] = -1_234;

        let mut emulator = JoystickEmulator::new(1, &previous, 0);
        // Drain init events.
        let mut buf = [0u8; 512];
        emulator.read(&mut buf);

        emulator.update(&previous, &current, 16);
        assert_eq!(emulator.pending(), 2);

        let n = emulator.read(&mut buf);
        assert_eq!(n, 2 * JsEvent::WIRE_SIZE);
        // Button press first.
        assert_eq!(buf[6], JS_EVENT_BUTTON);
        assert_eq!(buf[7], 1);
        // Then the axis move.
        assert_eq!(buf[14], JS_EVENT_AXIS);
        assert_eq!(i16::from_le_bytes([buf[12], buf[13]]), -1_234);
    }

    #[test]
    fn partial_reads_return_whole_events_only() {
        let mut snapshot = InputSnapshot::default();
        let mut emulator = JoystickEmulator::new(0, &snapshot, 0);

        let mut tiny = [0u8; JsEvent::WIRE_SIZE + 3];
        let n = emulator.read(&mut tiny);
        assert_eq!(n, JsEvent::WIRE_SIZE);

        snapshot.controllers[0].buttons = 1;
        let mut empty = [0u8; 4];
        assert_eq!(emulator.read(&mut empty), 0);
    }

    #[test]
    fn queue_drops_at_limit() {
        let previous = InputSnapshot::default();
        let mut emulator = JoystickEmulator::new(0, &previous, 0);
        let mut buf = [0u8; 512];
        emulator.read(&mut buf);

        let mut on = InputSnapshot::default();
        on.controllers[0].buttons = 1;
        let off = InputSnapshot::default();
        for i in 0..EVENT_QUEUE_LIMIT {
            if i % 2 == 0 {
                emulator.update(&off, &on, i as u32);
            } else {
                emulator.update(&on, &off, i as u32);
            }
        }
        assert!(emulator.pending() <= EVENT_QUEUE_LIMIT);
    }
}
