use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tether_proto::{Message, Route};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{BusError, KvError};
use crate::traits::{Acknowledge, Bus, KvBackend};
use crate::types::{Inbound, Membership, MessageId, Subscription};

const SUBSCRIPTION_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.data
            .write()
            .await
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError> {
        let mut data = self.data.write().await;
        let matches = match (expected, data.get(key)) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == cur.as_slice(),
            _ => false,
        };
        if matches {
            data.insert(key.to_string(), new.to_vec());
        }
        Ok(matches)
    }
}

#[derive(Debug, Default)]
struct Topic {
    subscribers: Vec<mpsc::Sender<Inbound>>,
    cursor: usize,
}

#[derive(Debug, Default)]
struct BusState {
    topics: HashMap<String, Topic>,
    /// Per-message mark counts, kept only by recording buses.
    marks: Option<HashMap<MessageId, u32>>,
    marked: u64,
    next_id: u64,
}

impl BusState {
    fn pick(&mut self, key: &str) -> Option<mpsc::Sender<Inbound>> {
        let topic = self.topics.get_mut(key)?;
        topic.subscribers.retain(|s| !s.is_closed());
        if topic.subscribers.is_empty() {
            return None;
        }
        let index = topic.cursor % topic.subscribers.len();
        topic.cursor = topic.cursor.wrapping_add(1);
        Some(topic.subscribers[index].clone())
    }
}

/// In-process bus. Each route is a topic with competing subscribers served
/// round-robin.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that also remembers how often each message was marked.
    pub fn recording() -> Self {
        let state = BusState {
            marks: Some(HashMap::new()),
            ..BusState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Hands `message` to a subscriber of `via`, whatever the message's own
    /// addressing says.
    pub async fn deliver_on(&self, via: &Route, message: Message) -> Result<MessageId, BusError> {
        let key = via.key();
        let (id, sender) = {
            let mut state = self.state.lock().await;
            let sender = state
                .pick(&key)
                .ok_or_else(|| BusError::NoSubscriber(key.clone()))?;
            state.next_id += 1;
            (MessageId::new(format!("mem-{}", state.next_id)), sender)
        };

        let ack = MemoryAck {
            id: id.clone(),
            claimed: AtomicBool::new(false),
            state: Arc::clone(&self.state),
        };
        sender
            .send(Inbound::new(id.clone(), message, Box::new(ack)))
            .await
            .map_err(|_| BusError::NoSubscriber(key))?;
        Ok(id)
    }

    /// How many times the message was marked processed. Always 0 unless the
    /// bus was built with [`MemoryBus::recording`].
    pub async fn mark_count(&self, id: &MessageId) -> u32 {
        self.state
            .lock()
            .await
            .marks
            .as_ref()
            .and_then(|marks| marks.get(id).copied())
            .unwrap_or(0)
    }

    /// Total number of marks across all messages.
    pub async fn marked(&self) -> u64 {
        self.state.lock().await.marked
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, route: &Route, message: &Message) -> Result<(), BusError> {
        self.deliver_on(route, message.clone()).await.map(|_| ())
    }

    async fn subscribe(&self, membership: &Membership) -> Result<Subscription, BusError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut state = self.state.lock().await;
        for route in membership.routes() {
            state
                .topics
                .entry(route.key())
                .or_default()
                .subscribers
                .push(sender.clone());
        }
        Ok(Subscription::new(receiver))
    }
}

struct MemoryAck {
    id: MessageId,
    claimed: AtomicBool,
    state: Arc<Mutex<BusState>>,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn confirm(&self) -> bool {
        !self.claimed.swap(true, Ordering::SeqCst)
    }

    async fn mark(&self) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state.marked = state.marked.wrapping_add(1);
        if let Some(marks) = state.marks.as_mut() {
            *marks.entry(self.id.clone()).or_insert(0) += 1;
        }
        Ok(())
    }
}
