//! # kvconf
//!
//! Typed configuration kept in sync with a file or a key/value store, with
//! listeners notified per field when the configuration changes.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────┐  load / watch  ┌──────────┐  reload  ┌─────────────┐  diff per path  ┌───────────┐
//! │  Store  │───────────────▶│ Backend  │─────────▶│ ConfigStore │────────────────▶│ Listeners │
//! │ (file,  │                │ (codec,  │          │ (instance,  │                 │ "Addr",   │
//! │ consul) │◀───────────────│ retries) │          │  snapshot)  │                 │ "Svc[0]"  │
//! └─────────┘   bootstrap    └──────────┘          └─────────────┘                 └───────────┘
//! ```
//!
//! - **Layout**: `#[derive(KvLayout)]` with `#[kv(key = "...")]` decides which
//!   fields stay inline and which get their own keys
//! - **Codec**: [`core::marshal`] / [`core::unmarshal`] map objects to flat entries
//! - **Store**: [`ConfigStore`] holds the instance and calls field listeners
//! - **Backends**: files out of the box, Consul with the `consul` feature,
//!   any flat store through [`runtime::KvBackend`]
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kvconf::prelude::*;
//!
//! #[derive(Debug, Clone, Default, Serialize, Deserialize, KvLayout)]
//! #[serde(rename_all = "PascalCase")]
//! struct ServiceConfig {
//!     addr: String,
//!     #[kv(key = "data_source/")]
//!     data_source: HashMap<String, String>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = ConfigStore::new();
//!     kvconf::register_remote_backends(&store);
//!     store.init(
//!         Options::new()
//!             .url("consul://127.0.0.1:8500/services/demo")?
//!             .default_config(ServiceConfig::default()),
//!     ).await?;
//!
//!     store.set_typed_field_listener("DataSource.cache", |old: String, new: String| {
//!         tracing::info!(%old, %new, "cache moved");
//!     });
//!     Ok(())
//! }
//! ```
//!
//! `#[derive(KvLayout)]` works with only `kvconf` as a dependency. Crates
//! that reach kvconf through a re-export name the path themselves with
//! `#[kv(crate = "my_dep::kvconf::core")]`.
//!
//! ## Standard Store
//!
//! For untyped use, a process-wide store over `serde_json::Value` is available
//! through [`standard`], [`init`], [`set_field_listener`], [`get_config`] and
//! [`add_backend`].
//!
//! ## Features
//!
//! - `consul` (default): Consul KV backend
//! - `toml-config` / `yaml-config`: settings files for [`runtime::SettingsLoader`]
//! - `json-log`: JSON log lines

use std::sync::OnceLock;

use serde_json::Value;

pub use kvconf_core as core;
pub use kvconf_macros::KvLayout;
pub use kvconf_runtime as runtime;

#[cfg(feature = "consul")]
pub use kvconf_adapter_consul as consul;

pub use kvconf_core::{FieldPath, Kv, Location};
pub use kvconf_runtime::{
    ChangeKind, ConfigError, ConfigResult, ConfigStore, FieldChange, OnChange, Options,
};

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use kvconf::prelude::*;
/// ```
pub mod prelude {
    pub use kvconf_core::{Backend, Configuration, Kv, KvClient, KvConnector, KvLayout, LoadOptions};
    pub use kvconf_macros::KvLayout;
    pub use kvconf_runtime::{
        ChangeKind, ConfigError, ConfigResult, ConfigStore, FieldChange, KvBackend, MemoryKv,
        Options,
    };
}

/// Registers every remote backend enabled by features on `store`.
pub fn register_remote_backends<T: kvconf_core::Configuration>(store: &ConfigStore<T>) {
    #[cfg(feature = "consul")]
    kvconf_adapter_consul::register(store);
    #[cfg(not(feature = "consul"))]
    let _ = store;
}

// =============================================================================
// Standard store
// =============================================================================

static STANDARD: OnceLock<ConfigStore<Value>> = OnceLock::new();

/// The process-wide store over `serde_json::Value`.
///
/// It starts out holding an empty object, so [`init`] without a location
/// succeeds, and has every feature-enabled remote backend registered.
pub fn standard() -> &'static ConfigStore<Value> {
    STANDARD.get_or_init(|| {
        let store = ConfigStore::with_default(Value::Object(Default::default()));
        register_remote_backends(&store);
        store
    })
}

/// Initializes the standard store.
pub async fn init(options: Options<Value>) -> ConfigResult<()> {
    standard().init(options).await
}

/// Listens for changes at `path` of the standard store; `""` listens to
/// everything.
pub fn set_field_listener<F>(path: &str, callback: F)
where
    F: Fn(&FieldChange) + Send + Sync + 'static,
{
    standard().set_field_listener(path, callback);
}

/// Returns the standard store's configuration.
pub fn get_config() -> Option<Value> {
    standard().get_config()
}

/// Registers a backend on the standard store.
pub fn add_backend<B>(scheme: &str, backend: B)
where
    B: kvconf_core::Backend<Value> + 'static,
{
    standard().add_backend(scheme, backend);
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, KvLayout)]
    #[serde(rename_all = "PascalCase")]
    struct Service {
        addr: String,
        #[kv(key = "data_source/")]
        data_source: std::collections::BTreeMap<String, String>,
    }

    #[test]
    fn test_derive_through_facade() {
        use crate::core::{KvLayout as _, Shape};

        let layout = Service::default().kv_layout();
        assert_eq!(layout.shape, Shape::Record);
        assert_eq!(layout.fields[1].name, "DataSource");
        assert_eq!(layout.fields[1].shape, Shape::Map);
    }

    #[tokio::test]
    async fn test_standard_store() {
        #[cfg(feature = "consul")]
        assert!(standard().has_backend("consul"));

        let kv = runtime::MemoryKv::new();
        kv.put("/app/config", r#"{"Addr":":8080","Debug":true}"#);
        add_backend("memory", kv.backend());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        set_field_listener("Addr", move |change| {
            if let Ok(mut seen) = sink.lock() {
                seen.push(change.new.clone());
            }
        });

        init(Options::new()).await.unwrap();
        assert_eq!(get_config(), Some(json!({})));
        assert!(seen.lock().unwrap().is_empty());

        let options = Options::new()
            .url("memory://local/app/config")
            .unwrap()
            .watch(false);
        init(options).await.unwrap();
        assert_eq!(get_config(), Some(json!({"Addr": ":8080", "Debug": true})));
        assert_eq!(*seen.lock().unwrap(), vec![json!(":8080")]);
    }
}
