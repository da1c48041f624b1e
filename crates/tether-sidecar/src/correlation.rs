//! Rendezvous between outstanding calls and their callbacks.
//!
//! Each pending call owns a slot holding both halves of a one-shot channel.
//! The callback side takes the sender, the waiting side takes the receiver,
//! and since a oneshot buffers its single value the two may arrive in either
//! order. Delivering never blocks.

use dashmap::DashMap;
use tether_proto::{Reply, RequestId};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AwaitError {
    #[error("no pending request {0}")]
    NotFound(RequestId),

    #[error("cancelled while waiting for a reply")]
    Cancelled,
}

#[derive(Debug)]
struct Slot {
    sender: Option<oneshot::Sender<Reply>>,
    receiver: Option<oneshot::Receiver<Reply>>,
}

/// Removes a slot once its waiter is done with it.
struct SlotGuard<'a> {
    slots: &'a DashMap<RequestId, Slot>,
    request: &'a RequestId,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.remove(self.request);
    }
}

/// Handle returned by [`CorrelationTable::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct PendingReply {
    request: RequestId,
}

impl PendingReply {
    pub fn request(&self) -> &RequestId {
        &self.request
    }
}

/// Pending calls keyed by request id.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    slots: DashMap<RequestId, Slot>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a slot for `request`. Registering an id twice replaces the
    /// earlier slot.
    pub fn register(&self, request: RequestId) -> PendingReply {
        let (sender, receiver) = oneshot::channel();
        self.slots.insert(
            request.clone(),
            Slot {
                sender: Some(sender),
                receiver: Some(receiver),
            },
        );
        PendingReply { request }
    }

    /// Hands `reply` to the slot for `request`. Returns false when no slot
    /// exists, the slot was already answered, or its waiter gave up.
    pub fn deliver(&self, request: &RequestId, reply: Reply) -> bool {
        let sender = self
            .slots
            .get_mut(request)
            .and_then(|mut slot| slot.sender.take());

        let Some(sender) = sender else {
            tracing::warn!(request = %request, "Unexpected callback");
            return false;
        };

        if sender.send(reply).is_err() {
            tracing::debug!(request = %request, "Callback arrived after its waiter left");
            self.slots.remove(request);
            return false;
        }
        true
    }

    /// Waits for the reply to `request`, or for `cancel`. The slot is removed
    /// either way, including when the returned future is dropped.
    pub async fn wait(
        &self,
        request: &RequestId,
        cancel: &CancellationToken,
    ) -> Result<Reply, AwaitError> {
        let receiver = self
            .slots
            .get_mut(request)
            .and_then(|mut slot| slot.receiver.take())
            .ok_or_else(|| AwaitError::NotFound(request.clone()))?;
        let _slot = SlotGuard {
            slots: &self.slots,
            request,
        };

        tokio::select! {
            biased;
            reply = receiver => reply.map_err(|_| AwaitError::Cancelled),
            () = cancel.cancelled() => Err(AwaitError::Cancelled),
        }
    }

    /// Drops the slot for `request` without waiting.
    pub fn abandon(&self, request: &RequestId) {
        self.slots.remove(request);
    }

    /// Drops every slot; waiters see [`AwaitError::Cancelled`].
    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
