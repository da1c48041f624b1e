//! Bus and key-value backends used by tether sidecars.
//!
//! Both are external collaborators of the sidecar: the bus delivers each
//! published message to one subscriber of its route and lets the consumer
//! confirm and mark it; the store holds simple application state.

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "valkey")]
mod valkey;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use error::{BusError, KvError, StateError};
pub use traits::{Acknowledge, Bus, KvBackend};
pub use types::{Inbound, Membership, MessageId, Subscription};

#[cfg(feature = "memory")]
pub use memory::{MemoryBus, MemoryKv};

#[cfg(feature = "valkey")]
pub use valkey::{ValkeyBus, ValkeyKv};

#[cfg(feature = "config")]
pub use config::{BusConfig, KvConfig, StateConfig};

#[cfg(feature = "config")]
pub use provider::StateProvider;
