//! Topic based publish/subscribe used to keep cached copies of shared state
//! coherent between everything holding one.
//!
//! The in-process [`LocalPubSub`] fans each topic out through a
//! `tokio::sync::broadcast` channel. A cross-process bus only needs to
//! implement [`PubSub`].

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

/// Per-topic channel capacity. Slow subscribers lag and skip to the newest
/// payload rather than blocking publishers.
const TOPIC_CAPACITY: usize = 64;

pub type Payload = Arc<[u8]>;

#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    fn subscribe_raw(&self, topic: &str) -> broadcast::Receiver<Payload>;
}

/// Topic name bound to the payload type carried on it.
pub struct TypedKey<T> {
    name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedKey<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for TypedKey<T> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<T> std::fmt::Debug for TypedKey<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TypedKey").field(&self.name).finish()
    }
}

pub async fn publish<T: Serialize>(bus: &dyn PubSub, key: &TypedKey<T>, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    bus.publish_raw(key.name(), payload).await
}

pub fn subscribe<T: DeserializeOwned>(bus: &dyn PubSub, key: &TypedKey<T>) -> Subscription<T> {
    Subscription {
        topic: key.name().to_string(),
        rx: bus.subscribe_raw(key.name()),
        _marker: PhantomData,
    }
}

pub struct Subscription<T> {
    topic: String,
    rx: broadcast::Receiver<Payload>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    /// Waits for the next decodable payload. Returns `None` once the bus is
    /// gone. Undecodable payloads and lag gaps are logged and skipped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(value) => return Some(value),
                    Err(e) => debug!("PubSub: dropping bad payload on '{}': {}", self.topic, e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("PubSub: subscriber on '{}' skipped {} payloads", self.topic, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[derive(Default)]
pub struct LocalPubSub {
    topics: Mutex<HashMap<String, broadcast::Sender<Payload>>>,
}

impl LocalPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Payload> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish_raw(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let sender = self.sender(topic);
        // No subscribers is not an error: nobody holds a copy to refresh.
        let delivered = sender.send(Payload::from(payload)).unwrap_or(0);
        debug!("PubSub: published on '{}' to {} subscribers", topic, delivered);
        Ok(())
    }

    fn subscribe_raw(&self, topic: &str) -> broadcast::Receiver<Payload> {
        self.sender(topic).subscribe()
    }
}
