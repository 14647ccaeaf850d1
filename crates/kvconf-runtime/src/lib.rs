//! kvconf Runtime - keeps typed configuration in sync with its store.
//!
//! This crate provides:
//! - The configuration store with field-level change listeners (`ConfigStore`)
//! - Load options parsed from location URLs (`Options`)
//! - The local file backend (`FileBackend`)
//! - A generic backend for flat key/value stores (`KvBackend`) and an
//!   in-process store (`MemoryKv`)
//! - Engine settings (`config`) and logging setup (`logging`)
//!
//! # Example
//!
//! ```rust,ignore
//! use kvconf_runtime::{ConfigStore, Options, logging::LoggingBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     LoggingBuilder::new().init();
//!
//!     let store = ConfigStore::new();
//!     store.init(
//!         Options::new()
//!             .url("conf/service.yaml")?
//!             .default_config(ServiceConfig::default())
//!             .watch(true),
//!     ).await?;
//!
//!     store.set_typed_field_listener("Addr", |old: String, new: String| {
//!         tracing::info!(%old, %new, "listen address changed");
//!     });
//!     Ok(())
//! }
//! ```
//!
//! # Remote Stores
//!
//! Stores other than files are registered per URL scheme:
//!
//! ```rust,ignore
//! store.add_backend("consul", KvBackend::new(ConsulConnector::new()));
//! ```

pub mod config;
pub mod error;
pub mod file;
pub mod logging;
pub mod memory;
pub mod options;
pub mod remote;
pub mod store;

// Re-exports
pub use config::{LoggingSettings, Settings, SettingsLoader, load_settings};
pub use error::{ConfigError, ConfigResult};
pub use file::{FileBackend, FileFormat};
pub use logging::{LoggingBuilder, SpanEvents};
pub use memory::MemoryKv;
pub use options::{DEFAULT_RELOAD_DELAY, DEFAULT_TIMEOUT, Options};
pub use remote::KvBackend;
pub use store::{ChangeKind, ConfigStore, FieldChange, OnChange, zero_value};

// Re-export tracing for use by other crates
pub use tracing;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use super::store::{ChangeKind, ConfigStore, FieldChange};
    pub use super::options::Options;
    pub use tracing::{debug, error, info, trace, warn};
}
