//! Common types for mqttc.

use bytes::Bytes;

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,
    /// At least once delivery, acknowledged with PUBACK.
    AtLeastOnce = 1,
    /// Exactly once delivery, four-step handshake.
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// A message published to or received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery QoS.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set the delivery QoS.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Message the broker publishes on the client's behalf after an unclean
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, message: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            message: message.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Handler for messages delivered to a subscription.
///
/// Handlers run on the reader task with no engine lock held, so they may
/// call back into the client. They should not block.
pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> Handler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::from_u8(3), None);
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("a/b", "hi")
            .with_qos(QoS::AtLeastOnce)
            .with_retain(true);
        assert_eq!(msg.topic, "a/b");
        assert_eq!(msg.payload, Bytes::from("hi"));
        assert_eq!(msg.qos, QoS::AtLeastOnce);
        assert!(msg.retain);
    }

    #[test]
    fn test_closure_handler() {
        let count = AtomicUsize::new(0);
        let handler = |_: &Message| {
            count.fetch_add(1, Ordering::SeqCst);
        };
        handler.handle(&Message::new("t", ""));
        handler.handle(&Message::new("t", ""));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
