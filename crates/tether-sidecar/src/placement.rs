//! Actor placement: which sidecar runs a given actor instance.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tether_proto::ActorRef;
use tether_state::{KvBackend, KvError};

#[async_trait]
pub trait Placement: Send + Sync + fmt::Debug {
    /// Whether this sidecar should execute invocations on `actor`. Only
    /// consulted for actor types the sidecar hosts.
    async fn owns(&self, actor: &ActorRef) -> Result<bool, KvError>;
}

/// Every sidecar hosting a type owns all of its instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPlacement;

#[async_trait]
impl Placement for LocalPlacement {
    async fn owns(&self, _actor: &ActorRef) -> Result<bool, KvError> {
        Ok(true)
    }
}

/// First sidecar to touch an instance claims it in the shared store.
pub struct StorePlacement {
    kv: Arc<dyn KvBackend>,
    sidecar: String,
}

impl fmt::Debug for StorePlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorePlacement")
            .field("sidecar", &self.sidecar)
            .finish_non_exhaustive()
    }
}

impl StorePlacement {
    pub fn new(kv: Arc<dyn KvBackend>, sidecar: impl Into<String>) -> Self {
        Self {
            kv,
            sidecar: sidecar.into(),
        }
    }

    fn key(actor: &ActorRef) -> String {
        format!("placement:{}:{}", actor.actor_type, actor.id)
    }
}

#[async_trait]
impl Placement for StorePlacement {
    async fn owns(&self, actor: &ActorRef) -> Result<bool, KvError> {
        let key = Self::key(actor);

        if let Some(owner) = self.kv.get(&key).await? {
            return Ok(owner == self.sidecar.as_bytes());
        }

        if self.kv.cas(&key, None, self.sidecar.as_bytes()).await? {
            tracing::debug!(actor = %actor, sidecar = %self.sidecar, "Claimed actor");
            return Ok(true);
        }

        // Lost the race; the winner is now recorded.
        let owner = self.kv.get(&key).await?;
        Ok(owner.as_deref() == Some(self.sidecar.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use tether_state::MemoryKv;

    use super::*;

    #[tokio::test]
    async fn local_placement_owns_everything() {
        assert!(LocalPlacement.owns(&ActorRef::new("A", "1")).await.unwrap());
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let a = StorePlacement::new(Arc::clone(&kv), "car-a");
        let b = StorePlacement::new(Arc::clone(&kv), "car-b");
        let actor = ActorRef::new("Counter", "c1");

        assert!(a.owns(&actor).await.unwrap());
        assert!(!b.owns(&actor).await.unwrap());
        assert!(a.owns(&actor).await.unwrap());

        let other = ActorRef::new("Counter", "c2");
        assert!(b.owns(&other).await.unwrap());
        assert!(!a.owns(&other).await.unwrap());
    }
}
