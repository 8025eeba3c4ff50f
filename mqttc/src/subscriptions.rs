//! Subscription registry.
//!
//! Topics map to their QoS, handler and activation flag. An entry stays
//! pending from `subscribe` until the broker's SUBACK, and pending entries
//! receive no messages. Topics match exactly; wildcards are not interpreted.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::{Handler, QoS};

/// One registered subscription.
#[derive(Clone)]
pub struct Subscription {
    pub qos: QoS,
    pub handler: Arc<dyn Handler>,
    pub pending: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("qos", &self.qos)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `topic` as pending, replacing any previous entry.
    pub fn add(&mut self, topic: impl Into<String>, qos: QoS, handler: Arc<dyn Handler>) {
        self.entries.insert(
            topic.into(),
            Subscription {
                qos,
                handler,
                pending: true,
            },
        );
    }

    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        self.entries.remove(topic)
    }

    /// Flips the activation flag. Returns false if `topic` is not registered.
    pub fn set_pending(&mut self, topic: &str, pending: bool) -> bool {
        match self.entries.get_mut(topic) {
            Some(entry) => {
                entry.pending = pending;
                true
            }
            None => false,
        }
    }

    /// Handler for an inbound message on `topic`, if an active entry exists.
    pub fn route(&self, topic: &str) -> Option<Arc<dyn Handler>> {
        self.entries
            .get(topic)
            .filter(|entry| !entry.pending)
            .map(|entry| entry.handler.clone())
    }

    pub fn get(&self, topic: &str) -> Option<&Subscription> {
        self.entries.get(topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Subscription)> {
        self.entries.iter().map(|(topic, sub)| (topic.as_str(), sub))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn Handler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: Arc<dyn Handler> = Arc::new(move |_: &Message| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn test_pending_not_routed() {
        let mut registry = SubscriptionRegistry::new();
        let (count, handler) = counting();
        registry.add("a/b", QoS::AtLeastOnce, handler);

        assert!(registry.get("a/b").unwrap().pending);
        assert!(registry.route("a/b").is_none());

        assert!(registry.set_pending("a/b", false));
        let handler = registry.route("a/b").unwrap();
        handler.handle(&Message::new("a/b", "x"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exact_match_only() {
        let mut registry = SubscriptionRegistry::new();
        let (_, handler) = counting();
        registry.add("a/+", QoS::AtMostOnce, handler);
        registry.set_pending("a/+", false);

        assert!(registry.route("a/b").is_none());
        assert!(registry.route("a/+").is_some());
    }

    #[test]
    fn test_remove() {
        let mut registry = SubscriptionRegistry::new();
        let (_, handler) = counting();
        registry.add("t", QoS::AtMostOnce, handler);
        registry.set_pending("t", false);

        assert!(registry.remove("t").is_some());
        assert!(registry.route("t").is_none());
        assert!(!registry.set_pending("t", false));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_replaces_and_resets_pending() {
        let mut registry = SubscriptionRegistry::new();
        let (_, first) = counting();
        let (_, second) = counting();
        registry.add("t", QoS::AtMostOnce, first);
        registry.set_pending("t", false);
        registry.add("t", QoS::ExactlyOnce, second);

        assert_eq!(registry.len(), 1);
        let entry = registry.get("t").unwrap();
        assert!(entry.pending);
        assert_eq!(entry.qos, QoS::ExactlyOnce);
    }
}
