//! Process-wide sidecar context shared by the dispatcher and HTTP handlers.

use std::sync::Arc;

use tether_proto::Target;
use tether_state::{Bus, KvBackend, Membership, StateProvider};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{PlacementMode, SidecarConfig};
use crate::correlation::CorrelationTable;
use crate::delivery::{HttpClient, LocalDelivery};
use crate::directory::{DirectRoute, Directory};
use crate::error::SidecarError;
use crate::placement::{LocalPlacement, Placement, StorePlacement};
use crate::retry::RetryPolicy;

/// Identity of this sidecar on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub service: Option<String>,
    pub actor_types: Vec<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            service: None,
            actor_types: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    #[must_use]
    pub fn with_actor_types(mut self, actor_types: Vec<String>) -> Self {
        self.actor_types = actor_types;
        self
    }

    pub fn hosts_actor_type(&self, actor_type: &str) -> bool {
        self.actor_types.iter().any(|t| t == actor_type)
    }

    pub fn membership(&self) -> Membership {
        let membership =
            Membership::new(self.id.clone()).with_actor_types(self.actor_types.clone());
        match &self.service {
            Some(service) => membership.with_service(service.clone()),
            None => membership,
        }
    }
}

pub struct SidecarState {
    identity: Identity,
    bus: Arc<dyn Bus>,
    kv: Arc<dyn KvBackend>,
    state_prefix: String,
    correlations: CorrelationTable,
    local: Arc<dyn LocalDelivery>,
    client: HttpClient,
    placement: Arc<dyn Placement>,
    directory: Directory,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SidecarState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarState")
            .field("identity", &self.identity)
            .field("pending", &self.correlations.len())
            .field("local", &self.local)
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

impl SidecarState {
    /// Builds the context from configuration. A missing sidecar id is
    /// generated.
    pub fn from_config(
        config: &SidecarConfig,
        provider: &StateProvider,
        cancel: CancellationToken,
    ) -> Self {
        let id = config
            .sidecar
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut identity = Identity::new(id).with_actor_types(config.sidecar.actors.clone());
        if let Some(service) = &config.sidecar.service {
            identity = identity.with_service(service.clone());
        }

        let client = HttpClient::new(
            &config.app.client_settings(),
            RetryPolicy::from(&config.retry),
            cancel.clone(),
        );
        let local: Arc<dyn LocalDelivery> = Arc::new(client.for_base(config.app.base_url()));

        let placement: Arc<dyn Placement> = match config.placement.mode {
            PlacementMode::Local => Arc::new(LocalPlacement),
            PlacementMode::Store => Arc::new(StorePlacement::new(provider.kv(), identity.id.clone())),
        };

        let directory = Directory::new(config.direct.routes.clone())
            .with_local(identity.service.clone(), identity.actor_types.clone());

        Self {
            identity,
            bus: provider.bus(),
            kv: provider.kv(),
            state_prefix: config.sidecar.state_prefix.clone(),
            correlations: CorrelationTable::new(),
            local,
            client,
            placement,
            directory,
            cancel,
        }
    }

    /// Replaces the delivery to the local application.
    #[must_use]
    pub fn with_local_delivery(mut self, local: Arc<dyn LocalDelivery>) -> Self {
        self.local = local;
        self
    }

    #[must_use]
    pub fn with_placement(mut self, placement: Arc<dyn Placement>) -> Self {
        self.placement = placement;
        self
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn kv(&self) -> &Arc<dyn KvBackend> {
        &self.kv
    }

    pub fn correlations(&self) -> &CorrelationTable {
        &self.correlations
    }

    pub fn local(&self) -> &Arc<dyn LocalDelivery> {
        &self.local
    }

    pub fn placement(&self) -> &Arc<dyn Placement> {
        &self.placement
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Store key for an application key.
    pub fn state_key(&self, key: &str) -> String {
        format!("{}:{}", self.state_prefix, key)
    }

    /// Delivery for a direct invocation of `target`.
    pub fn direct_delivery(&self, target: &Target) -> Result<Arc<dyn LocalDelivery>, SidecarError> {
        match self.directory.resolve(target) {
            Some(DirectRoute::Local) => Ok(Arc::clone(&self.local)),
            Some(DirectRoute::Remote(base)) => Ok(Arc::new(self.client.for_base(base))),
            None => Err(SidecarError::NoDirectRoute(target.to_string())),
        }
    }
}
