//! Settings of the engine itself.
//!
//! These are not the configuration objects the store manages: they describe
//! where that configuration lives and how the process logs, and are read from
//! defaults, an optional settings file and `KVCONF_*` environment variables.

pub mod loader;
pub mod schema;

pub use loader::{SettingsLoader, load_settings};
pub use schema::{LogFormat, LogLevel, LogOutput, LoggingSettings, Settings};
