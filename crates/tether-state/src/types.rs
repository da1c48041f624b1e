use std::fmt;

use tether_proto::{Message, Route};
use tokio::sync::mpsc;

use crate::error::BusError;
use crate::traits::Acknowledge;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The routes a sidecar listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub sidecar: String,
    pub service: Option<String>,
    pub actor_types: Vec<String>,
}

impl Membership {
    pub fn new(sidecar: impl Into<String>) -> Self {
        Self {
            sidecar: sidecar.into(),
            service: None,
            actor_types: Vec::new(),
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_actor_types(mut self, actor_types: Vec<String>) -> Self {
        self.actor_types = actor_types;
        self
    }

    pub fn routes(&self) -> Vec<Route> {
        let mut routes = vec![Route::Sidecar(self.sidecar.clone())];
        routes.extend(self.service.iter().cloned().map(Route::Service));
        routes.extend(self.actor_types.iter().cloned().map(Route::Actor));
        routes
    }
}

/// One message received from the bus.
pub struct Inbound {
    id: MessageId,
    message: Message,
    ack: Box<dyn Acknowledge>,
}

impl Inbound {
    pub fn new(id: MessageId, message: Message, ack: Box<dyn Acknowledge>) -> Self {
        Self { id, message, ack }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn confirm(&self) -> bool {
        self.ack.confirm().await
    }

    pub async fn mark(&self) -> Result<(), BusError> {
        self.ack.mark().await
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("id", &self.id)
            .field("message", &self.message)
            .finish()
    }
}

/// Stream of inbound messages for one [`Membership`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Inbound>,
}

impl Subscription {
    pub fn new(receiver: mpsc::Receiver<Inbound>) -> Self {
        Self { receiver }
    }

    /// Next inbound message, or `None` once the bus side has shut down.
    pub async fn next(&mut self) -> Option<Inbound> {
        self.receiver.recv().await
    }
}
