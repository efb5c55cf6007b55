use std::time::{Duration, Instant};

/// Tracks the last time a worker produced output and answers whether it has
/// been silent long enough to count as idle. Fires the idle transition
/// exactly once per silence period, re-arming as soon as new output arrives.
pub struct IdleTracker {
    threshold: Duration,
    last_output_at: Instant,
    idle_fired: bool,
}

impl IdleTracker {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_output_at: Instant::now(),
            idle_fired: false,
        }
    }

    pub fn note_output(&mut self) {
        self.last_output_at = Instant::now();
        self.idle_fired = false;
    }

    /// Returns `true` the first time the idle threshold is crossed since
    /// the last output; returns `false` on every subsequent call until
    /// output resets it.
    pub fn check_idle_transition(&mut self) -> bool {
        if self.idle_fired {
            return false;
        }
        if self.last_output_at.elapsed() >= self.threshold {
            self.idle_fired = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_idle_exactly_once_until_output_resets_it() {
        let mut tracker = IdleTracker::new(Duration::from_millis(0));
        assert!(tracker.check_idle_transition());
        assert!(!tracker.check_idle_transition());

        tracker.note_output();
        assert!(tracker.check_idle_transition());
    }
}
