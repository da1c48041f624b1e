use std::sync::Arc;

use crate::config::{BusConfig, KvConfig, StateConfig};
use crate::error::StateError;
use crate::traits::{Bus, KvBackend};

#[cfg(feature = "memory")]
use crate::memory::{MemoryBus, MemoryKv};

#[cfg(feature = "valkey")]
use crate::valkey::{ValkeyBus, ValkeyKv};

/// The bus and store handles a sidecar runs against.
#[derive(Clone)]
pub struct StateProvider {
    bus: Arc<dyn Bus>,
    kv: Arc<dyn KvBackend>,
}

impl StateProvider {
    pub fn new(bus: Arc<dyn Bus>, kv: Arc<dyn KvBackend>) -> Self {
        Self { bus, kv }
    }

    pub async fn from_config(config: &StateConfig) -> Result<Self, StateError> {
        Ok(Self {
            bus: Self::create_bus(&config.bus).await?,
            kv: Self::create_kv_backend(&config.store).await?,
        })
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        Arc::clone(&self.bus)
    }

    pub fn kv(&self) -> Arc<dyn KvBackend> {
        Arc::clone(&self.kv)
    }

    async fn create_bus(config: &BusConfig) -> Result<Arc<dyn Bus>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            BusConfig::Memory => Ok(Arc::new(MemoryBus::new())),

            #[cfg(feature = "valkey")]
            BusConfig::Valkey {
                url,
                prefix,
                pool_size,
                block_ms,
                batch,
            } => {
                let bus = ValkeyBus::new(
                    url,
                    prefix.clone(),
                    *pool_size,
                    std::time::Duration::from_millis(*block_ms),
                    *batch,
                )
                .await
                .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(bus))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable bus backend enabled".to_string(),
            )),
        }
    }

    async fn create_kv_backend(config: &KvConfig) -> Result<Arc<dyn KvBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            KvConfig::Memory => Ok(Arc::new(MemoryKv::new())),

            #[cfg(feature = "valkey")]
            KvConfig::Valkey {
                url,
                namespace,
                pool_size,
            } => {
                let kv = ValkeyKv::new(url, namespace.clone(), *pool_size)
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(kv))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable KV backend enabled".to_string(),
            )),
        }
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_config_builds_memory_backends() {
        let provider = StateProvider::from_config(&StateConfig::default())
            .await
            .unwrap();
        provider.kv().put("k", b"v").await.unwrap();
        assert_eq!(provider.kv().get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
