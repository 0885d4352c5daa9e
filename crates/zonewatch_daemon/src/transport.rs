//! In-process message channel.
//!
//! Named topics with at-least-once delivery. A consumer pulls a [`Delivery`]
//! and must settle it with [`Delivery::finish`] or [`Delivery::requeue`]; a
//! delivery dropped without being settled goes back on its topic. Each topic
//! caps the number of unsettled deliveries with a semaphore.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub body: Vec<u8>,
    /// Times this message was handed out before and not finished.
    pub attempts: u32,
}

pub struct Topic {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<mpsc::UnboundedReceiver<Message>>,
    pending: AtomicUsize,
    depth: usize,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    closed: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopicStats {
    pub name: String,
    pub pending: usize,
    pub in_flight: usize,
    pub closed: bool,
}

impl Topic {
    fn new(name: &str, depth: usize, max_in_flight: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.to_string(),
            tx,
            rx: Mutex::new(rx),
            pending: AtomicUsize::new(0),
            depth,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages queued and not yet handed out.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Deliveries handed out and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight
            .saturating_sub(self.in_flight.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses further publishes and wakes consumers waiting for a slot.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.in_flight.close();
    }

    pub fn stats(&self) -> TopicStats {
        TopicStats {
            name: self.name.clone(),
            pending: self.pending(),
            in_flight: self.in_flight(),
            closed: self.is_closed(),
        }
    }

    pub fn publish(&self, body: Vec<u8>) -> Result<Uuid, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(self.name.clone()));
        }
        if self.pending.fetch_add(1, Ordering::AcqRel) >= self.depth {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Full {
                topic: self.name.clone(),
                depth: self.depth,
            });
        }

        let message = Message {
            id: Uuid::new_v4(),
            body,
            attempts: 0,
        };
        let id = message.id;
        if self.tx.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(TransportError::Closed(self.name.clone()));
        }
        Ok(id)
    }

    /// Puts an unfinished message back; bypasses the depth limit.
    fn redeliver(&self, mut message: Message) {
        message.attempts += 1;
        self.pending.fetch_add(1, Ordering::AcqRel);
        let id = message.id;
        if self.tx.send(message).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(topic = %self.name, message_id = %id, "Topic receiver gone, message lost");
        }
    }

    /// Waits for an in-flight slot and the next message.
    ///
    /// Returns `None` once the topic is closed.
    pub async fn next(self: &Arc<Self>) -> Option<Delivery> {
        let permit = Arc::clone(&self.in_flight).acquire_owned().await.ok()?;
        let message = self.rx.lock().await.recv().await?;
        Some(self.hand_out(message, permit))
    }

    /// Non-blocking variant of [`Topic::next`].
    pub fn try_next(self: &Arc<Self>) -> Option<Delivery> {
        let permit = Arc::clone(&self.in_flight).try_acquire_owned().ok()?;
        let message = self.rx.try_lock().ok()?.try_recv().ok()?;
        Some(self.hand_out(message, permit))
    }

    fn hand_out(self: &Arc<Self>, message: Message, permit: OwnedSemaphorePermit) -> Delivery {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        Delivery {
            message: Some(message),
            topic: Arc::clone(self),
            _permit: permit,
        }
    }
}

/// A message handed to a consumer, holding one in-flight slot until settled.
pub struct Delivery {
    message: Option<Message>,
    topic: Arc<Topic>,
    _permit: OwnedSemaphorePermit,
}

impl Delivery {
    pub fn id(&self) -> Uuid {
        self.message.as_ref().map(|m| m.id).unwrap_or_default()
    }

    pub fn body(&self) -> &[u8] {
        self.message.as_ref().map(|m| m.body.as_slice()).unwrap_or_default()
    }

    pub fn attempts(&self) -> u32 {
        self.message.as_ref().map(|m| m.attempts).unwrap_or_default()
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempts() > 0
    }

    /// Acknowledges the message; it will not be delivered again.
    pub fn finish(mut self) {
        if let Some(message) = self.message.take() {
            debug!(topic = %self.topic.name, message_id = %message.id, "Delivery finished");
        }
    }

    /// Returns the message to its topic for another attempt.
    pub fn requeue(mut self) {
        if let Some(message) = self.message.take() {
            self.topic.redeliver(message);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            warn!(
                topic = %self.topic.name,
                message_id = %message.id,
                "Delivery dropped unsettled, requeueing"
            );
            self.topic.redeliver(message);
        }
    }
}

/// Broker owning every named topic.
pub struct MessageQueue {
    topics: RwLock<HashMap<String, Arc<Topic>>>,
    depth: usize,
    max_in_flight: usize,
}

impl MessageQueue {
    pub fn new(depth: usize, max_in_flight: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            depth,
            max_in_flight,
        }
    }

    /// Returns the named topic, creating it on first use.
    pub fn topic(&self, name: &str) -> Arc<Topic> {
        {
            let topics = self.topics.read().unwrap_or_else(|poisoned| {
                warn!("Topic registry lock was poisoned, recovering");
                poisoned.into_inner()
            });
            if let Some(topic) = topics.get(name) {
                return Arc::clone(topic);
            }
        }

        let mut topics = self.topics.write().unwrap_or_else(|poisoned| {
            warn!("Topic registry lock was poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(
            topics
                .entry(name.to_string())
                .or_insert_with(|| Topic::new(name, self.depth, self.max_in_flight)),
        )
    }

    pub fn publish(&self, topic: &str, body: Vec<u8>) -> Result<Uuid, TransportError> {
        self.topic(topic).publish(body)
    }

    pub fn close(&self) {
        let topics = self.topics.read().unwrap_or_else(|poisoned| {
            warn!("Topic registry lock was poisoned, recovering");
            poisoned.into_inner()
        });
        for topic in topics.values() {
            topic.close();
        }
    }

    pub fn stats(&self) -> Vec<TopicStats> {
        let topics = self.topics.read().unwrap_or_else(|poisoned| {
            warn!("Topic registry lock was poisoned, recovering");
            poisoned.into_inner()
        });
        let mut stats: Vec<TopicStats> = topics.values().map(|topic| topic.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}
