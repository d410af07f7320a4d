//! Frame timing for the frame pacer.

use std::time::{Duration, Instant};

/// Number of frames averaged by [`FrameTimer::average_frame_time`].
const HISTORY_LEN: usize = 32;

/// Measures the wall-clock time between consecutive frame boundaries.
///
/// The pacer calls [`FrameTimer::tick`] once per completed frame. The timer
/// keeps a short ring of recent frame durations so callers can display a
/// smoothed frame time without doing their own bookkeeping.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    history: [Duration; HISTORY_LEN],
    recorded: usize,
}

impl FrameTimer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            history: [Duration::ZERO; HISTORY_LEN],
            recorded: 0,
        }
    }

    /// Total time since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Marks a frame boundary and returns the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.history[self.recorded % HISTORY_LEN] = delta;
        self.recorded += 1;
        delta
    }

    /// Duration of the most recent frame, or zero before the first tick.
    pub fn last_frame_time(&self) -> Duration {
        if self.recorded == 0 {
            return Duration::ZERO;
        }
        self.history[(self.recorded - 1) % HISTORY_LEN]
    }

    /// Mean duration over the last (up to 32) frames.
    pub fn average_frame_time(&self) -> Duration {
        let count = self.recorded.min(HISTORY_LEN);
        if count == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.history[..count].iter().sum();
        total / count as u32
    }

    /// Number of ticks since creation or the last reset.
    pub fn frames(&self) -> usize {
        self.recorded
    }

    /// Reset the timer to the current time and forget the history.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
        self.history = [Duration::ZERO; HISTORY_LEN];
        self.recorded = 0;
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_timer_reports_zero() {
        let timer = FrameTimer::new();
        assert_eq!(timer.last_frame_time(), Duration::ZERO);
        assert_eq!(timer.average_frame_time(), Duration::ZERO);
        assert_eq!(timer.frames(), 0);
    }

    #[test]
    fn test_tick_records_history() {
        let mut timer = FrameTimer::new();
        let first = timer.tick();
        let second = timer.tick();
        assert_eq!(timer.frames(), 2);
        assert_eq!(timer.last_frame_time(), second);
        assert!(timer.average_frame_time() <= first.max(second));
    }

    #[test]
    fn test_reset_clears_history() {
        let mut timer = FrameTimer::new();
        timer.tick();
        timer.reset();
        assert_eq!(timer.frames(), 0);
    }
}
