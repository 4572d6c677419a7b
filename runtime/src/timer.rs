//! The deterministic timer.
//!
//! The target never sees the host clock. Monotonic time starts at zero and
//! advances by exactly one frame interval per boundary; wall time is the
//! configured initial time plus the same ticks. Every virtualized time query
//! answers from here, so time is a pure function of the frame count and the
//! pushed configuration.

use framelock_logging::Log;
use framelock_protocol::{FrameCounterState, SharedConfig, TimeSpec};

#[derive(Debug)]
pub struct DeterministicTimer {
    frame_count: u64,
    /// Monotonic ticks since session start.
    ticks: TimeSpec,
    /// Wall clock at frame zero, from the pushed configuration.
    wall_base: TimeSpec,
    /// Per-frame increment, from the configured framerate.
    interval: TimeSpec,
}

impl DeterministicTimer {
    pub fn new(config: &SharedConfig) -> Self {
        let mut timer = Self {
            frame_count: 0,
            ticks: TimeSpec::default(),
            wall_base: TimeSpec::default(),
            interval: TimeSpec::default(),
        };
        timer.configure(config);
        timer
    }

    /// Adopts the timing-relevant fields of a pushed configuration. Does not
    /// touch elapsed ticks: a mid-session framerate change only affects
    /// frames from here on.
    pub fn configure(&mut self, config: &SharedConfig) {
        let (sec, nsec) = config.frame_interval();
        self.interval = TimeSpec::new(sec, nsec);
        self.wall_base = TimeSpec::new(config.initial_time_sec, config.initial_time_nsec);
    }

    /// Advances exactly one frame and returns the new counter state.
    pub fn advance_frame(&mut self) -> FrameCounterState {
        self.frame_count += 1;
        self.ticks = self.ticks.add(self.interval);
        tracing::trace!(target: Log::Time, frame = self.frame_count, "frame advanced");
        self.counters()
    }

    /// Counter state as of the last boundary, without advancing.
    pub fn counters(&self) -> FrameCounterState {
        FrameCounterState {
            frame_count: self.frame_count,
            monotonic: self.ticks,
            wall: self.wall_base.add(self.ticks),
        }
    }

    pub fn monotonic(&self) -> TimeSpec {
        self.ticks
    }

    pub fn wall(&self) -> TimeSpec {
        self.wall_base.add(self.ticks)
    }

    /// Overwrites counters wholesale, as happens on handshake and after a
    /// successful state restore.
    pub fn restore(&mut self, state: &FrameCounterState) {
        self.frame_count = state.frame_count;
        self.ticks = state.monotonic;
        tracing::debug!(target: Log::Time, frame = self.frame_count, "timer restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer_60fps() -> DeterministicTimer {
        DeterministicTimer::new(&SharedConfig::default())
    }

    #[test]
    fn advances_by_exact_interval() {
        let mut timer = timer_60fps();
        let first = timer.advance_frame();
        assert_eq!(first.frame_count, 1);
        assert_eq!(first.monotonic, TimeSpec::new(0, 16_666_666));

        for _ in 0..59 {
            timer.advance_frame();
        }
        let state = timer.counters();
        assert_eq!(state.frame_count, 60);
        // 60 * 16_666_666ns: just under one second, deterministically.
        assert_eq!(state.monotonic, TimeSpec::new(0, 999_999_960));
    }

    #[test]
    fn wall_time_rides_on_initial_time() {
        let config = SharedConfig {
            initial_time_sec: 1_000,
            initial_time_nsec: 0,
            ..Default::default()
        };
        let mut timer = DeterministicTimer::new(&config);
        timer.advance_frame();
        assert_eq!(timer.wall(), TimeSpec::new(1_000, 16_666_666));
    }

    #[test]
    fn restore_overwrites_wholesale() {
        let mut timer = timer_60fps();
        for _ in 0..50 {
            timer.advance_frame();
        }
        let saved = FrameCounterState {
            frame_count: 10,
            monotonic: TimeSpec::new(0, 166_666_660),
            wall: TimeSpec::default(),
        };
        timer.restore(&saved);
        assert_eq!(timer.counters().frame_count, 10);
        assert_eq!(timer.monotonic(), TimeSpec::new(0, 166_666_660));
    }

    #[test]
    fn two_timers_agree_frame_by_frame() {
        let mut a = timer_60fps();
        let mut b = timer_60fps();
        for _ in 0..120 {
            assert_eq!(a.advance_frame(), b.advance_frame());
        }
    }
}
