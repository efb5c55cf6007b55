use std::time::{Duration, Instant};

use crate::{ECHO_BUFFER_KEEP_BYTES, ECHO_BUFFER_MAX_BYTES};

/// A single delivery injected into a worker, waiting for its expected echo
/// to appear in the worker's output within the verification window.
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub delivery_id: String,
    /// The literal bytes written into the pty for this attempt, kept so a
    /// `RetryNeeded` outcome can actually re-inject it rather than just
    /// restarting the verification clock.
    pub injected_text: String,
    pub expected_echo: String,
    pub injected_at: Instant,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl PendingVerification {
    pub fn new(
        delivery_id: impl Into<String>,
        injected_text: impl Into<String>,
        expected_echo: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            delivery_id: delivery_id.into(),
            injected_text: injected_text.into(),
            expected_echo: expected_echo.into(),
            injected_at: Instant::now(),
            attempts: 1,
            max_attempts,
        }
    }

    pub fn has_timed_out(&self, window: Duration) -> bool {
        self.injected_at.elapsed() >= window
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// What happened to a pending verification on a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoOutcome {
    /// Expected echo text was found in the buffer; this delivery is confirmed.
    Verified,
    /// The window elapsed without a match and there are retries left; the
    /// caller should re-inject and call [`PendingVerification::attempts`] bump.
    RetryNeeded,
    /// The window elapsed, retries are exhausted: the delivery failed.
    Failed,
    /// Still within the window, no match yet.
    Pending,
}

/// Accumulates worker output into a rolling buffer and matches pending
/// deliveries' expected echo text against it.
#[derive(Default)]
pub struct EchoVerifier {
    buffer: String,
}

impl EchoVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        if self.buffer.len() > ECHO_BUFFER_MAX_BYTES {
            let trim_at = self.buffer.len() - ECHO_BUFFER_KEEP_BYTES;
            let boundary = floor_char_boundary(&self.buffer, trim_at);
            self.buffer.drain(..boundary);
        }
    }

    pub fn contains(&self, expected: &str) -> bool {
        self.buffer.contains(expected)
    }

    pub fn poll(&self, pending: &PendingVerification, window: Duration) -> EchoOutcome {
        if self.contains(&pending.expected_echo) {
            return EchoOutcome::Verified;
        }
        if !pending.has_timed_out(window) {
            return EchoOutcome::Pending;
        }
        if pending.attempts_exhausted() {
            EchoOutcome::Failed
        } else {
            EchoOutcome::RetryNeeded
        }
    }
}

/// `str::floor_char_boundary` is still unstable; this is the same
/// byte-scan-backwards approach used to avoid splitting a multi-byte
/// character when trimming the buffer.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut idx = index;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verified_once_expected_text_appears() {
        let mut verifier = EchoVerifier::new();
        verifier.feed("some preamble\nexpected-echo-123\nmore");
        let pending = PendingVerification::new("d1", "expected-echo-123\n", "expected-echo-123", 3);
        assert_eq!(
            verifier.poll(&pending, Duration::from_secs(5)),
            EchoOutcome::Verified
        );
    }

    #[test]
    fn pending_while_within_window_and_no_match() {
        let verifier = EchoVerifier::new();
        let pending = PendingVerification::new("d1", "nope\n", "nope", 3);
        assert_eq!(
            verifier.poll(&pending, Duration::from_secs(30)),
            EchoOutcome::Pending
        );
    }

    #[test]
    fn retry_then_failed_after_attempts_exhausted() {
        let verifier = EchoVerifier::new();
        let mut pending = PendingVerification::new("d1", "nope\n", "nope", 2);
        pending.injected_at = Instant::now() - Duration::from_secs(10);
        assert_eq!(
            verifier.poll(&pending, Duration::from_secs(1)),
            EchoOutcome::RetryNeeded
        );

        pending.attempts = 2;
        assert_eq!(
            verifier.poll(&pending, Duration::from_secs(1)),
            EchoOutcome::Failed
        );
    }

    #[test]
    fn buffer_trims_without_splitting_a_multibyte_boundary() {
        let mut verifier = EchoVerifier::new();
        let filler = "a".repeat(ECHO_BUFFER_MAX_BYTES);
        verifier.feed(&filler);
        verifier.feed("€€€tail");
        assert!(verifier.buffer.len() <= ECHO_BUFFER_MAX_BYTES);
        assert!(verifier.buffer.ends_with("tail"));
    }
}
