use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use relay_types::{DeliveryRecord, DeliveryState, Message};

/// Number of recent per-worker injection latencies kept for
/// [`DeliveryEngine::latency_percentile`].
const LATENCY_WINDOW: usize = 64;

/// What happened to a queued message as a result of a delivery engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The message is now the worker's in-flight delivery and should be
    /// injected by the caller.
    Dispatch(DeliveryRecord),
    /// The worker already has an in-flight delivery; this message stays
    /// queued behind it.
    Queued,
}

/// One worker's FIFO of pending messages plus its single in-flight slot.
/// Mirrors the one-job-per-worker dispatch discipline used for compute
/// jobs elsewhere in this codebase, generalized to message deliveries: a
/// worker only ever has one unconfirmed delivery outstanding at a time, so
/// echo verification can't be confused about which injection produced
/// which echo.
#[derive(Default)]
struct WorkerQueue {
    pending: VecDeque<Message>,
    in_flight: Option<DeliveryRecord>,
}

/// Routes messages to workers one at a time per worker, and tracks each
/// delivery from queued through verified or failed.
pub struct DeliveryEngine {
    queues: HashMap<String, WorkerQueue>,
    max_attempts: u32,
    latencies: HashMap<String, VecDeque<Duration>>,
}

impl DeliveryEngine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            queues: HashMap::new(),
            max_attempts,
            latencies: HashMap::new(),
        }
    }

    /// Enqueue `message` for `worker`. If the worker has no in-flight
    /// delivery, this message becomes it immediately.
    pub fn enqueue(&mut self, worker: &str, message: Message, expected_echo: String) -> DeliveryOutcome {
        let queue = self.queues.entry(worker.to_string()).or_default();

        if queue.in_flight.is_none() {
            let record = DeliveryRecord::new(
                relay_types::new_id(),
                message.id.clone(),
                worker.to_string(),
                expected_echo,
                self.max_attempts,
            );
            queue.in_flight = Some(record.clone());
            DeliveryOutcome::Dispatch(record)
        } else {
            queue.pending.push_back(message);
            DeliveryOutcome::Queued
        }
    }

    pub fn mark_injected(&mut self, worker: &str) {
        if let Some(queue) = self.queues.get_mut(worker) {
            if let Some(record) = queue.in_flight.as_mut() {
                record.state = DeliveryState::Injected;
                record.attempts += 1;
                record.injected_at = Some(chrono::Utc::now());
            }
        }
    }

    /// Confirm the worker's in-flight delivery and dispatch the next queued
    /// message, if any.
    pub fn mark_verified(&mut self, worker: &str) -> Option<DeliveryOutcome> {
        self.resolve_in_flight(worker, DeliveryState::Verified)
    }

    /// Fail the worker's in-flight delivery (attempts exhausted) and
    /// dispatch the next queued message, if any.
    pub fn mark_failed(&mut self, worker: &str) -> Option<DeliveryOutcome> {
        self.resolve_in_flight(worker, DeliveryState::Failed)
    }

    fn resolve_in_flight(&mut self, worker: &str, terminal: DeliveryState) -> Option<DeliveryOutcome> {
        let queue = self.queues.get_mut(worker)?;
        let mut record = queue.in_flight.take()?;
        record.state = terminal;

        if terminal == DeliveryState::Verified {
            if let Some(injected_at) = record.injected_at {
                if let Ok(elapsed) = (chrono::Utc::now() - injected_at).to_std() {
                    let samples = self.latencies.entry(worker.to_string()).or_default();
                    if samples.len() >= LATENCY_WINDOW {
                        samples.pop_front();
                    }
                    samples.push_back(elapsed);
                }
            }
        }

        let next = queue.pending.pop_front().map(|message| {
            let next_record = DeliveryRecord::new(
                relay_types::new_id(),
                message.id.clone(),
                worker.to_string(),
                message.body.clone(),
                self.max_attempts,
            );
            queue.in_flight = Some(next_record.clone());
            DeliveryOutcome::Dispatch(next_record)
        });

        next
    }

    pub fn in_flight(&self, worker: &str) -> Option<&DeliveryRecord> {
        self.queues.get(worker).and_then(|q| q.in_flight.as_ref())
    }

    pub fn queue_depth(&self, worker: &str) -> usize {
        self.queues.get(worker).map(|q| q.pending.len()).unwrap_or(0)
    }

    /// Nearest-rank percentile of injection-to-verification latency over the
    /// last [`LATENCY_WINDOW`] verified deliveries for `worker`, for
    /// `get_metrics` (§4.5). `percentile` is in `0.0..=100.0`.
    pub fn latency_percentile(&self, worker: &str, percentile: f64) -> Option<Duration> {
        let samples = self.latencies.get(worker)?;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort();
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::MessageTarget;

    fn msg(id: &str) -> Message {
        Message::new(id, "tester", MessageTarget::Worker("w1".into()), "hello")
    }

    #[test]
    fn first_message_dispatches_immediately() {
        let mut engine = DeliveryEngine::new(3);
        let outcome = engine.enqueue("w1", msg("m1"), "hello".into());
        assert!(matches!(outcome, DeliveryOutcome::Dispatch(_)));
    }

    #[test]
    fn second_message_queues_behind_in_flight() {
        let mut engine = DeliveryEngine::new(3);
        engine.enqueue("w1", msg("m1"), "hello".into());
        let outcome = engine.enqueue("w1", msg("m2"), "world".into());
        assert_eq!(outcome, DeliveryOutcome::Queued);
        assert_eq!(engine.queue_depth("w1"), 1);
    }

    #[test]
    fn verifying_in_flight_dispatches_next_queued_message() {
        let mut engine = DeliveryEngine::new(3);
        engine.enqueue("w1", msg("m1"), "hello".into());
        engine.enqueue("w1", msg("m2"), "world".into());

        let next = engine.mark_verified("w1");
        assert!(matches!(next, Some(DeliveryOutcome::Dispatch(_))));
        assert_eq!(engine.queue_depth("w1"), 0);
    }

    #[test]
    fn independent_workers_do_not_share_slots() {
        let mut engine = DeliveryEngine::new(3);
        engine.enqueue("w1", msg("m1"), "hello".into());
        let outcome = engine.enqueue("w2", msg("m2"), "world".into());
        assert!(matches!(outcome, DeliveryOutcome::Dispatch(_)));
    }

    #[test]
    fn verified_delivery_without_an_injected_at_records_no_sample() {
        let mut engine = DeliveryEngine::new(3);
        engine.enqueue("w1", msg("m1"), "hello".into());
        engine.mark_verified("w1");
        assert!(engine.latency_percentile("w1", 50.0).is_none());
    }

    #[test]
    fn verified_delivery_with_an_injected_at_produces_a_latency_sample() {
        let mut engine = DeliveryEngine::new(3);
        engine.enqueue("w1", msg("m1"), "hello".into());
        engine.mark_injected("w1");
        engine.mark_verified("w1");
        assert!(engine.latency_percentile("w1", 50.0).is_some());
    }

    #[test]
    fn unknown_worker_has_no_latency_samples() {
        let engine = DeliveryEngine::new(3);
        assert!(engine.latency_percentile("nobody", 99.0).is_none());
    }
}
