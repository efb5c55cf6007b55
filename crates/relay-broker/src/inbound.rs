use std::collections::HashMap;
use std::time::{Duration, Instant};

use relay_types::Message;

/// Accepts messages from outside the broker (the protocol stream's
/// `send_message` method, the companion WebSocket adapter, the HTTP
/// fallback path) and drops duplicates seen within the dedup TTL, keyed on
/// the caller-supplied idempotency key when present and the message id
/// otherwise.
pub struct InboundGateway {
    seen: HashMap<String, Instant>,
    dedup_ttl: Duration,
}

impl InboundGateway {
    pub fn new(dedup_ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            dedup_ttl,
        }
    }

    /// Returns `Some(message)` if this is the first time the key has been
    /// seen within the TTL, `None` if it's a duplicate.
    pub fn accept(&mut self, message: Message) -> Option<Message> {
        self.sweep();

        let key = message
            .dedup_key
            .clone()
            .unwrap_or_else(|| message.id.clone());

        if self.seen.contains_key(&key) {
            return None;
        }

        self.seen.insert(key, Instant::now());
        Some(message)
    }

    fn sweep(&mut self) {
        let ttl = self.dedup_ttl;
        self.seen.retain(|_, seen_at| seen_at.elapsed() < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::MessageTarget;

    fn msg(id: &str, dedup: Option<&str>) -> Message {
        let mut m = Message::new(id, "tester", MessageTarget::Broadcast, "hi");
        m.dedup_key = dedup.map(str::to_string);
        m
    }

    #[test]
    fn duplicate_dedup_key_is_dropped() {
        let mut gateway = InboundGateway::new(Duration::from_secs(60));
        assert!(gateway.accept(msg("m1", Some("k1"))).is_some());
        assert!(gateway.accept(msg("m2", Some("k1"))).is_none());
    }

    #[test]
    fn distinct_keys_both_pass() {
        let mut gateway = InboundGateway::new(Duration::from_secs(60));
        assert!(gateway.accept(msg("m1", Some("k1"))).is_some());
        assert!(gateway.accept(msg("m2", Some("k2"))).is_some());
    }

    #[test]
    fn falls_back_to_message_id_without_a_dedup_key() {
        let mut gateway = InboundGateway::new(Duration::from_secs(60));
        assert!(gateway.accept(msg("m1", None)).is_some());
        assert!(gateway.accept(msg("m1", None)).is_none());
    }

    #[test]
    fn expired_entries_are_forgotten() {
        let mut gateway = InboundGateway::new(Duration::from_millis(0));
        assert!(gateway.accept(msg("m1", Some("k1"))).is_some());
        std::thread::sleep(Duration::from_millis(5));
        assert!(gateway.accept(msg("m2", Some("k1"))).is_some());
    }
}
