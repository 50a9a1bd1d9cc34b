// Pacing for timed drives and stepper delays
//
// Every blocking motion goes through a `Clock` so tests can swap in a
// `VirtualClock` and never sleep for real.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use spin_sleep::SpinSleeper;

use crate::config::CANCEL_POLL_INTERVAL;

/// Source of real-time (or virtual) pauses
pub trait Clock: Send + Sync {
    /// Block the calling thread for `duration`
    fn pause(&self, duration: Duration);
}

/// Wall clock backed by a spin sleeper (accurate for millisecond step delays)
pub struct SystemClock {
    sleeper: SpinSleeper,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            sleeper: SpinSleeper::new(100_000),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn pause(&self, duration: Duration) {
        self.sleeper.sleep(duration);
    }
}

/// Clock that only accumulates time, for tests
#[derive(Default)]
pub struct VirtualClock {
    inner: Mutex<VirtualTime>,
}

#[derive(Default)]
struct VirtualTime {
    elapsed: Duration,
    pauses: usize,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total virtual time spent in pauses
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().elapsed
    }

    /// Number of `pause` calls so far
    pub fn pauses(&self) -> usize {
        self.inner.lock().pauses
    }
}

impl Clock for VirtualClock {
    fn pause(&self, duration: Duration) {
        let mut time = self.inner.lock();
        time.elapsed += duration;
        time.pauses += 1;
    }
}

/// Shared abort flag, polled between steps and pause slices
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the running motion stop at its next checkpoint
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Re-arm the token once a cancellation has been handled
    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// How a timed task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Elapsed,
    Cancelled,
}

/// A pause of fixed length that can be cut short by a `CancelToken`
#[derive(Debug, Clone, Copy)]
pub struct TimedTask {
    duration: Duration,
    poll: Duration,
}

impl TimedTask {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            poll: CANCEL_POLL_INTERVAL,
        }
    }

    /// Override the slice length between cancellation checks
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll.max(Duration::from_micros(1));
        self
    }

    /// Pause for the whole duration, checking `cancel` between slices
    pub fn run(&self, clock: &dyn Clock, cancel: &CancelToken) -> Completion {
        let mut remaining = self.duration;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return Completion::Cancelled;
            }
            let slice = remaining.min(self.poll);
            clock.pause(slice);
            remaining -= slice;
        }
        Completion::Elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_accumulates() {
        let clock = VirtualClock::new();
        clock.pause(Duration::from_millis(2));
        clock.pause(Duration::from_millis(3));
        assert_eq!(clock.elapsed(), Duration::from_millis(5));
        assert_eq!(clock.pauses(), 2);
    }

    #[test]
    fn test_timed_task_slices_duration() {
        let clock = VirtualClock::new();
        let task = TimedTask::new(Duration::from_millis(25))
            .with_poll_interval(Duration::from_millis(10));

        assert_eq!(task.run(&clock, &CancelToken::new()), Completion::Elapsed);
        assert_eq!(clock.elapsed(), Duration::from_millis(25));
        // 10 + 10 + 5
        assert_eq!(clock.pauses(), 3);
    }

    #[test]
    fn test_timed_task_zero_duration() {
        let clock = VirtualClock::new();
        let completion = TimedTask::new(Duration::ZERO).run(&clock, &CancelToken::new());
        assert_eq!(completion, Completion::Elapsed);
        assert_eq!(clock.pauses(), 0);
    }

    #[test]
    fn test_cancelled_task_does_not_pause() {
        let clock = VirtualClock::new();
        let token = CancelToken::new();
        token.cancel();

        let completion = TimedTask::new(Duration::from_secs(1)).run(&clock, &token);
        assert_eq!(completion, Completion::Cancelled);
        assert_eq!(clock.elapsed(), Duration::ZERO);

        token.clear();
        assert!(!token.is_cancelled());
    }
}
