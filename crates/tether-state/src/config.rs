use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StateConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub store: KvConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KvConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BusConfig {
    /// In-process bus; only sidecars sharing the process can reach each other.
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default = "default_stream_prefix")]
        prefix: String,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
        /// How long one read blocks waiting for new entries.
        #[serde(default = "default_block_ms")]
        block_ms: u64,
        #[serde(default = "default_batch")]
        batch: usize,
    },
}

#[cfg(feature = "valkey")]
fn default_pool_size() -> usize {
    10
}

#[cfg(feature = "valkey")]
fn default_stream_prefix() -> String {
    "tether".to_string()
}

#[cfg(feature = "valkey")]
fn default_block_ms() -> u64 {
    1000
}

#[cfg(feature = "valkey")]
fn default_batch() -> usize {
    64
}
