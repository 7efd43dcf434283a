//! Time-based gates used across the pipeline: the render-loop FPS cap,
//! the agent's back-buffer copy throttle, and the keep-alive watchdog.
//!
//! All three take explicit `Instant`s so the policies are testable
//! without sleeping.

use std::time::{Duration, Instant};

/// Caps the render loop at 100 FPS as a safety net against broken
/// vsync: a frame that completed in under 10 ms earns a sleep for the
/// remainder.
pub struct FrameLimiter {
    min_interval: Duration,
    last_frame: Option<Instant>,
}

impl FrameLimiter {
    pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(10);

    pub fn new() -> Self {
        Self::with_min_interval(Self::MIN_FRAME_INTERVAL)
    }

    pub fn with_min_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_frame: None,
        }
    }

    /// Records a completed frame and returns how long to sleep before
    /// the next one.
    pub fn frame_finished(&mut self, now: Instant) -> Duration {
        let pause = match self.last_frame {
            Some(previous) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(previous)),
            None => Duration::ZERO,
        };
        self.last_frame = Some(now);
        pause
    }
}

impl Default for FrameLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Limits how often the hooked present copies the compositor's back
/// buffer into the shared texture. The compositor presents at its own
/// rate (often 60+ Hz); one copy per 50 ms is plenty for a viewer.
pub struct CopyThrottle {
    min_interval: Duration,
    last_copy: Option<Instant>,
}

impl CopyThrottle {
    pub const MIN_COPY_INTERVAL: Duration = Duration::from_millis(50);

    pub fn new() -> Self {
        Self {
            min_interval: Self::MIN_COPY_INTERVAL,
            last_copy: None,
        }
    }

    /// Returns `true` (and arms the interval) when enough time has
    /// passed since the previous granted copy.
    pub fn should_copy(&mut self, now: Instant) -> bool {
        let due = match self.last_copy {
            Some(last) => now.saturating_duration_since(last) > self.min_interval,
            None => true,
        };
        if due {
            self.last_copy = Some(now);
        }
        due
    }
}

impl Default for CopyThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep-alive watchdog for the injected agent: the viewer posts a
/// keep-alive every second; if none arrives for more than two seconds
/// the viewer is gone and the agent should unload itself.
pub struct Watchdog {
    timeout: Duration,
    last_seen: Instant,
}

impl Watchdog {
    pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(2000);

    pub fn new(now: Instant) -> Self {
        Self {
            timeout: Self::KEEPALIVE_TIMEOUT,
            last_seen: now,
        }
    }

    pub fn refresh(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_sleeps_the_remainder_of_fast_frames() {
        let mut limiter = FrameLimiter::new();
        let start = Instant::now();

        assert_eq!(limiter.frame_finished(start), Duration::ZERO);
        let pause = limiter.frame_finished(start + Duration::from_millis(3));
        assert_eq!(pause, Duration::from_millis(7));
    }

    #[test]
    fn limiter_does_not_sleep_after_slow_frames() {
        let mut limiter = FrameLimiter::new();
        let start = Instant::now();

        limiter.frame_finished(start);
        let pause = limiter.frame_finished(start + Duration::from_millis(16));
        assert_eq!(pause, Duration::ZERO);
    }

    #[test]
    fn limiter_caps_a_run_of_frames_at_100_fps() {
        let mut limiter = FrameLimiter::new();
        let start = Instant::now();
        let frames = 50u32;

        // An instantaneous renderer: each frame finishes right after the
        // sleep the limiter requested.
        let mut clock = start;
        let mut total_sleep = Duration::ZERO;
        for _ in 0..frames {
            let pause = limiter.frame_finished(clock);
            clock += pause;
            total_sleep += pause;
        }
        assert!(total_sleep >= Duration::from_millis(10) * (frames - 1));
    }

    #[test]
    fn throttle_grants_at_most_21_copies_per_second_at_120hz() {
        let mut throttle = CopyThrottle::new();
        let start = Instant::now();

        let mut granted = 0;
        // 120 presents over one second.
        for i in 0..120u64 {
            let now = start + Duration::from_micros(i * 8_333);
            if throttle.should_copy(now) {
                granted += 1;
            }
        }
        assert!(granted <= 21, "granted {granted} copies");
        assert!(granted >= 15, "granted only {granted} copies");
    }

    #[test]
    fn throttle_enforces_minimum_separation() {
        let mut throttle = CopyThrottle::new();
        let start = Instant::now();

        assert!(throttle.should_copy(start));
        assert!(!throttle.should_copy(start + Duration::from_millis(50)));
        assert!(throttle.should_copy(start + Duration::from_millis(51)));
    }

    #[test]
    fn watchdog_expires_after_two_seconds_without_keepalive() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(start);

        assert!(!watchdog.expired(start + Duration::from_millis(1999)));
        assert!(watchdog.expired(start + Duration::from_millis(2001)));

        watchdog.refresh(start + Duration::from_millis(2001));
        assert!(!watchdog.expired(start + Duration::from_millis(4000)));
        assert!(watchdog.expired(start + Duration::from_millis(4002)));
    }
}
