//! # Consul backend for kvconf
//!
//! Serves configuration from the Consul KV store through the agent's HTTP
//! API. Reads and writes go through the generic [`KvBackend`], so layouts,
//! bootstrapping, retries and watches behave exactly as for any other flat
//! store; this crate only speaks Consul:
//!
//! - `GET /v1/kv/<key>` (with `recurse` for directory keys), base64 values
//! - `PUT /v1/kv/<key>` for bootstrapping
//! - blocking queries on `X-Consul-Index` for watches
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kvconf_runtime::{ConfigStore, Options};
//!
//! let store = ConfigStore::new();
//! kvconf_adapter_consul::register(&store);
//! store.init(
//!     Options::new()
//!         .url("consul://127.0.0.1:8500/app/config?datacenter=dc1")?
//!         .default_config(AppConfig::default()),
//! ).await?;
//! ```
//!
//! See [`settings`] for the location parameters understood.

pub mod client;
pub mod model;
pub mod settings;

pub use client::{ConsulClient, ConsulConnector};
pub use settings::ConsulSettings;

use kvconf_core::Configuration;
use kvconf_runtime::{ConfigStore, KvBackend};

/// URL scheme served by this backend.
pub const SCHEME: &str = "consul";

/// The Consul backend.
pub type ConsulBackend = KvBackend<ConsulConnector>;

/// Creates a Consul backend.
pub fn backend() -> ConsulBackend {
    KvBackend::new(ConsulConnector::new())
}

/// Registers a Consul backend on `store` under the `consul` scheme.
pub fn register<T: Configuration>(store: &ConfigStore<T>) {
    store.add_backend(SCHEME, backend());
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kvconf_macros::KvLayout;
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, Default, Serialize, Deserialize, KvLayout)]
    struct AppConfig {
        addr: String,
        #[kv(key = "data_source/")]
        data_source: BTreeMap<String, String>,
    }

    #[test]
    fn test_register() {
        let store: ConfigStore<AppConfig> = ConfigStore::new();
        assert!(!store.has_backend(SCHEME));
        register(&store);
        assert!(store.has_backend(SCHEME));
    }
}
