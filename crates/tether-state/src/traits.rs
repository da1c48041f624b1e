use async_trait::async_trait;
use tether_proto::{Message, Route};

use crate::error::{BusError, KvError};
use crate::types::{Membership, Subscription};

#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Writes `new` only if the current value equals `expected` (`None` = absent).
    async fn cas(&self, key: &str, expected: Option<&[u8]>, new: &[u8]) -> Result<bool, KvError>;
}

/// Publish/subscribe transport shared by all sidecars.
///
/// A published message reaches one subscriber of its route. Subscribers
/// confirm each inbound message before processing it and mark it once done.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, route: &Route, message: &Message) -> Result<(), BusError>;

    /// Subscribes to every route of `membership`.
    async fn subscribe(&self, membership: &Membership) -> Result<Subscription, BusError>;
}

/// Transport-side acknowledgement of one inbound message.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Claims the message for processing. Returns false if another consumer
    /// already owns it.
    async fn confirm(&self) -> bool;

    /// Marks the message as processed so it is not redelivered.
    async fn mark(&self) -> Result<(), BusError>;
}
