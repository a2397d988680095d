//! Cross-tab broadcast.
//!
//! The primary channel for telling other tabs about a mutation. Receivers drop
//! their own messages and messages for other projects; everything else goes
//! through the engine inbox and the usual accept-if-newer rule, so duplicate
//! delivery is harmless.

use crate::clock::Timestamp;
use crate::events::{EventBus, Shared, Subscription};
use crate::writer_id::WriterId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("Broadcast channel closed")]
    Closed,

    #[error("Broadcast post failed: {0}")]
    Post(String),
}

pub type Result<T> = std::result::Result<T, BroadcastError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    /// Collection name.
    pub topic: String,
    pub project_id: String,
    pub origin: WriterId,
    pub timestamp: Timestamp,
    pub payload: Value,
}

/// Transport that delivers a message to every other tab.
///
/// On native platforms, implementations must be `Send + Sync` for use across threads.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait BroadcastChannel: Send + Sync {
    fn post(&self, message: &BroadcastMessage) -> Result<()>;
}

/// Transport that delivers a message to every other tab (WASM version without Send + Sync).
#[cfg(target_arch = "wasm32")]
pub trait BroadcastChannel {
    fn post(&self, message: &BroadcastMessage) -> Result<()>;
}

/// In-process channel shared by several engines. Used by tests and by the
/// native host, which has a single writer.
#[derive(Default)]
pub struct BroadcastHub {
    bus: Shared<EventBus<BroadcastMessage>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every message posted to the hub.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn subscribe_all(
        &self,
        handler: impl Fn(BroadcastMessage) + Send + Sync + 'static,
    ) -> Subscription<BroadcastMessage> {
        self.bus.subscribe(handler)
    }

    /// Receive messages for one topic.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(BroadcastMessage) + Send + Sync + 'static,
    ) -> Subscription<BroadcastMessage> {
        let topic = topic.to_string();
        self.bus.subscribe(move |message: BroadcastMessage| {
            if message.topic == topic {
                handler(message);
            }
        })
    }

    #[cfg(target_arch = "wasm32")]
    pub fn subscribe_all(
        &self,
        handler: impl Fn(BroadcastMessage) + 'static,
    ) -> Subscription<BroadcastMessage> {
        self.bus.subscribe(handler)
    }

    #[cfg(target_arch = "wasm32")]
    pub fn subscribe(
        &self,
        topic: &str,
        handler: impl Fn(BroadcastMessage) + 'static,
    ) -> Subscription<BroadcastMessage> {
        let topic = topic.to_string();
        self.bus.subscribe(move |message: BroadcastMessage| {
            if message.topic == topic {
                handler(message);
            }
        })
    }
}

impl BroadcastChannel for BroadcastHub {
    fn post(&self, message: &BroadcastMessage) -> Result<()> {
        self.bus.emit(message.clone());
        Ok(())
    }
}

/// One writer's view of the broadcast channel.
pub struct BroadcastBus<C: BroadcastChannel + ?Sized> {
    channel: Shared<C>,
    writer: WriterId,
    project_id: String,
}

impl<C: BroadcastChannel + ?Sized> BroadcastBus<C> {
    pub fn new(channel: Shared<C>, writer: WriterId, project_id: &str) -> Self {
        Self {
            channel,
            writer,
            project_id: project_id.to_string(),
        }
    }

    pub fn publish(&self, topic: &str, payload: Value, timestamp: Timestamp) -> Result<()> {
        let message = BroadcastMessage {
            topic: topic.to_string(),
            project_id: self.project_id.clone(),
            origin: self.writer,
            timestamp,
            payload,
        };
        debug!("Broadcast {} at {}", topic, timestamp);
        self.channel.post(&message)
    }

    /// Whether a received message should be processed by this writer.
    pub fn accepts(&self, message: &BroadcastMessage) -> bool {
        message.origin != self.writer && message.project_id == self.project_id
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_publish_reaches_topic_subscribers() {
        let hub = Shared::new(BroadcastHub::new());
        let received = Shared::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = hub.subscribe("images", move |msg| {
            sink.lock().unwrap().push(msg.topic);
        });

        let bus = BroadcastBus::new(hub.clone(), WriterId::from(1), "proj_1");
        bus.publish("images", Value::Null, Timestamp::legacy(1)).unwrap();
        bus.publish("formData", Value::Null, Timestamp::legacy(2)).unwrap();

        assert_eq!(*received.lock().unwrap(), vec!["images".to_string()]);
    }

    #[test]
    fn test_receivers_drop_own_and_foreign_messages() {
        let hub = Shared::new(BroadcastHub::new());
        let tab1 = BroadcastBus::new(hub.clone(), WriterId::from(1), "proj_1");
        let tab2 = BroadcastBus::new(hub.clone(), WriterId::from(2), "proj_1");

        let message = BroadcastMessage {
            topic: "images".into(),
            project_id: "proj_1".into(),
            origin: WriterId::from(1),
            timestamp: Timestamp::legacy(1),
            payload: Value::Null,
        };
        assert!(!tab1.accepts(&message));
        assert!(tab2.accepts(&message));

        let foreign = BroadcastMessage {
            project_id: "proj_2".into(),
            ..message
        };
        assert!(!tab2.accepts(&foreign));
    }

    #[test]
    fn test_message_json_shape() {
        let message = BroadcastMessage {
            topic: "images".into(),
            project_id: "proj_1".into(),
            origin: WriterId::from(1),
            timestamp: Timestamp::new(5, WriterId::from(1)),
            payload: serde_json::json!([]),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["origin"], "0000000000000001");
        assert_eq!(json["projectId"], "proj_1");
    }
}
